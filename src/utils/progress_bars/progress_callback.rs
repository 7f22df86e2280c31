// src/utils/progress_bars/progress_callback.rs - Progress callbacks for long-running runs

use log::{debug, info};
use std::sync::Arc;
use std::time::Instant;

use crate::utils::db_connect::{get_pool_status, PgPool};
use crate::utils::progress_bars::progress_config::ProgressConfig;

/// Type alias for progress callback functions
/// Takes phase name and optional detailed progress information
pub type ProgressCallback = Arc<dyn Fn(String, Option<String>) + Send + Sync>;

/// Helper function to create a simple progress callback that only logs at debug level
pub fn create_simple_callback(method_name: &str) -> ProgressCallback {
    let method_name = method_name.to_string();
    Arc::new(move |phase: String, details: Option<String>| {
        let detail_str = details.map(|d| format!(" - {}", d)).unwrap_or_default();
        debug!("[{}] Progress: {}{}", method_name, phase, detail_str);
    })
}

/// Callback for a matching run: logs each update with elapsed time and,
/// when configured, connection pool usage.
pub fn create_run_callback(run_id: &str, pool: Option<PgPool>, config: &ProgressConfig) -> ProgressCallback {
    let run_id = run_id.to_string();
    let show_pool = config.should_show_db_connection_stats();
    let started = Instant::now();
    Arc::new(move |phase: String, details: Option<String>| {
        let detail_str = details.map(|d| format!(" - {}", d)).unwrap_or_default();
        let pool_str = match (&pool, show_pool) {
            (Some(pool), true) => {
                let (in_use, idle) = get_pool_status(pool);
                format!(" [db: {} in use, {} idle]", in_use, idle)
            }
            _ => String::new(),
        };
        info!(
            "[{}] {}{} [+{:.1}s]{}",
            run_id,
            phase,
            detail_str,
            started.elapsed().as_secs_f32(),
            pool_str
        );
    })
}

/// Convenience macro for reporting a phase through an optional callback
#[macro_export]
macro_rules! update_progress {
    ($callback:expr, $phase:expr) => {
        if let Some(ref cb) = $callback {
            cb($phase.to_string(), None);
        }
    };
    ($callback:expr, $phase:expr, $details:expr) => {
        if let Some(ref cb) = $callback {
            cb($phase.to_string(), Some($details.to_string()));
        }
    };
}

/// Convenience macro for updating progress with a current/total count
#[macro_export]
macro_rules! update_detailed_progress {
    ($callback:expr, $phase:expr, $current:expr, $total:expr) => {
        if let Some(ref cb) = $callback {
            let details = format!("{}/{}", $current, $total);
            cb($phase.to_string(), Some(details));
        }
    };
    ($callback:expr, $phase:expr, $current:expr, $total:expr, $extra:expr) => {
        if let Some(ref cb) = $callback {
            let details = format!("{}/{} ({})", $current, $total, $extra);
            cb($phase.to_string(), Some(details));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_macros_call_through() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let callback: Option<ProgressCallback> = Some(Arc::new(move |phase: String, details: Option<String>| {
            sink.lock().unwrap().push((phase, details));
        }));

        update_progress!(callback, "Loading");
        update_progress!(callback, "Matching", "page 1");
        update_detailed_progress!(callback, "Replaying", 5, 10);
        update_detailed_progress!(callback, "Replaying", 10, 10, "done");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], ("Loading".to_string(), None));
        assert_eq!(calls[2].1.as_deref(), Some("5/10"));
        assert_eq!(calls[3].1.as_deref(), Some("10/10 (done)"));
    }

    #[test]
    fn test_absent_callback_is_noop() {
        let callback: Option<ProgressCallback> = None;
        update_progress!(callback, "Loading");
        update_detailed_progress!(callback, "Replaying", 1, 2);
    }

    #[test]
    fn test_simple_and_run_callbacks() {
        let simple = create_simple_callback("TestMethod");
        simple("TestPhase".to_string(), Some("TestDetails".to_string()));

        let run = create_run_callback("run-1", None, &ProgressConfig::default());
        run("Matching".to_string(), None);
    }
}
