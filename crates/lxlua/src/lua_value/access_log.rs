// Table access logging.
//
// When enabled globally, every table read/write that passes the filter set
// emits one structured record. Filters combine include/exclude pattern
// lists over keys, values and operation names, type filters, and integer
// range checks; optional deduplication suppresses repeated (op, key) pairs.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessOp {
    Get,
    Set,
}

impl AccessOp {
    pub fn name(self) -> &'static str {
        match self {
            AccessOp::Get => "get",
            AccessOp::Set => "set",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AccessLogFilter {
    pub include_keys: Vec<String>,
    pub exclude_keys: Vec<String>,
    pub include_values: Vec<String>,
    pub exclude_values: Vec<String>,
    pub include_ops: Vec<String>,
    pub exclude_ops: Vec<String>,
    pub include_key_types: Vec<String>,
    pub include_value_types: Vec<String>,
    pub key_int_range: Option<(i64, i64)>,
    pub value_int_range: Option<(i64, i64)>,
}

/// A record as seen by the filter, already rendered to text by the caller.
#[derive(Debug, Clone)]
pub struct AccessRecord<'a> {
    pub op: AccessOp,
    pub key: &'a str,
    pub key_type: &'a str,
    pub key_int: Option<i64>,
    pub value: &'a str,
    pub value_type: &'a str,
    pub value_int: Option<i64>,
    pub source: &'a str,
}

const DEDUP_CAP: usize = 4096;

pub struct AccessLog {
    enabled: bool,
    filter_enabled: bool,
    filter: AccessLogFilter,
    dedup: bool,
    seen: HashSet<(AccessOp, String)>,
    pub records_emitted: u64,
}

impl AccessLog {
    pub fn new() -> Self {
        AccessLog {
            enabled: false,
            filter_enabled: false,
            filter: AccessLogFilter::default(),
            dedup: false,
            seen: HashSet::new(),
            records_emitted: 0,
        }
    }

    pub fn set_enabled(&mut self, on: bool) -> bool {
        let was = self.enabled;
        self.enabled = on;
        was
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_filter_enabled(&mut self, on: bool) {
        self.filter_enabled = on;
    }

    pub fn filter_mut(&mut self) -> &mut AccessLogFilter {
        &mut self.filter
    }

    pub fn clear_filters(&mut self) {
        self.filter = AccessLogFilter::default();
    }

    pub fn set_dedup(&mut self, on: bool) {
        self.dedup = on;
        if !on {
            self.seen.clear();
        }
    }

    fn matches_any(patterns: &[String], text: &str) -> bool {
        patterns.iter().any(|p| text.contains(p.as_str()))
    }

    fn passes(&self, r: &AccessRecord<'_>) -> bool {
        let f = &self.filter;
        if !self.filter_enabled {
            return true;
        }
        if !f.include_ops.is_empty() && !Self::matches_any(&f.include_ops, r.op.name()) {
            return false;
        }
        if Self::matches_any(&f.exclude_ops, r.op.name()) {
            return false;
        }
        if !f.include_keys.is_empty() && !Self::matches_any(&f.include_keys, r.key) {
            return false;
        }
        if Self::matches_any(&f.exclude_keys, r.key) {
            return false;
        }
        if !f.include_values.is_empty() && !Self::matches_any(&f.include_values, r.value) {
            return false;
        }
        if Self::matches_any(&f.exclude_values, r.value) {
            return false;
        }
        if !f.include_key_types.is_empty()
            && !f.include_key_types.iter().any(|t| t == r.key_type)
        {
            return false;
        }
        if !f.include_value_types.is_empty()
            && !f.include_value_types.iter().any(|t| t == r.value_type)
        {
            return false;
        }
        if let Some((lo, hi)) = f.key_int_range {
            match r.key_int {
                Some(k) if k >= lo && k <= hi => {}
                _ => return false,
            }
        }
        if let Some((lo, hi)) = f.value_int_range {
            match r.value_int {
                Some(v) if v >= lo && v <= hi => {}
                _ => return false,
            }
        }
        true
    }

    /// Emit one record if it survives filtering and dedup.
    pub fn record(&mut self, r: AccessRecord<'_>) {
        if !self.enabled || !self.passes(&r) {
            return;
        }
        if self.dedup {
            if self.seen.len() >= DEDUP_CAP {
                self.seen.clear();
            }
            if !self.seen.insert((r.op, r.key.to_string())) {
                return;
            }
        }
        self.records_emitted += 1;
        tracing::info!(
            target: "lxlua::table_access",
            op = r.op.name(),
            key = r.key,
            key_type = r.key_type,
            value = r.value,
            value_type = r.value_type,
            source = r.source,
        );
    }
}

impl Default for AccessLog {
    fn default() -> Self {
        Self::new()
    }
}
