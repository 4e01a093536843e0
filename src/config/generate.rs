pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# ACUVIM-COLLECT CONFIGURATION
# =============================================================================
# Settings for collecting the historical energy log of Acuvim CL meters over
# Modbus TCP. Every section and key is optional; omitted values use the
# defaults shown here.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/acuvim-collect/config.yml
#   3. /etc/acuvim-collect/config.yml
#
# Paths may use ~ and $env{...} environment references.

# =============================================================================
# TRANSPORT
# =============================================================================
transport:
  # Modbus TCP port used when a meter does not specify one
  port: 502
  # Bound on every single register transfer
  timeout: 3s

# =============================================================================
# RETRY
# =============================================================================
# Failed register reads are retried with exponential backoff: the wait starts
# at initial_backoff and doubles up to max_backoff. Clock writes are never
# retried.
retry:
  # Total attempts per operation, the first one included
  max_attempts: 3
  initial_backoff: 500ms
  max_backoff: 10s

# =============================================================================
# PAGING
# =============================================================================
paging:
  # Records per log window read (1-8, a window holds at most 8 records)
  records_per_page: 8
  # Historical log selector (0 = log 1)
  log_type: 0
  # How long to wait for the meter to load a window
  ready_timeout: 5s
  ready_poll_interval: 200ms
  # How 'last N minutes' finds its first record: 'binary' or 'sequential'
  search: binary

# =============================================================================
# TIME SYNC
# =============================================================================
sync:
  # Drift beyond this many seconds is corrected (with --sync-time)
  allowed_drift_seconds: 60
  # Abort collection when a clock correction does not take
  required: false

# =============================================================================
# STORAGE
# =============================================================================
# Fleet registry and resume pointers
storage:
  path: ~/.local/share/acuvim-collect/collector.duckdb
  # How often a running collection persists its progress
  checkpoint_interval: 30s

# =============================================================================
# OUTPUT
# =============================================================================
output:
  # TSV files are written as <directory>/<serial>.tsv unless --output is given
  # or the meter has its own output folder
  directory: ./data
  # Append the meter's record number as a final 'record_index' column
  include_index: false

# =============================================================================
# FLEET
# =============================================================================
fleet:
  # Meters collected at the same time by 'acuvim-collect fleet'
  max_concurrent: 4
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_starter_config_parses() {
        let config = parse_config(&generate_starter_config()).unwrap();
        assert_eq!(config.paging.records_per_page, 8);
        assert_eq!(config.fleet.max_concurrent, 4);
    }
}
