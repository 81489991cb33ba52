
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static COMPARTMENTS_CREATED: OnceLock<IntCounter> = OnceLock::new();
static COMPARTMENTS_CLEANED: OnceLock<IntCounterVec> = OnceLock::new();
static RECORDS_PURGED: OnceLock<IntCounter> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static REMOTE_SYNC_FAILURES: OnceLock<IntCounterVec> = OnceLock::new();
static VAULT_OPERATIONS: OnceLock<IntCounterVec> = OnceLock::new();

/// Registers every collector. Recording before this call is a no-op.
pub fn init_metrics() -> anyhow::Result<()> {
    let created = match COMPARTMENTS_CREATED.get() {
        Some(c) => c.clone(),
        None => {
            let c = IntCounter::new("compartments_created_total", "Compartments created")?;
            COMPARTMENTS_CREATED.get_or_init(|| c).clone()
        }
    };
    let cleaned = match COMPARTMENTS_CLEANED.get() {
        Some(c) => c.clone(),
        None => {
            let c = IntCounterVec::new(
                prometheus::opts!("compartments_cleaned_total", "Compartments cleaned up"),
                &["reason"],
            )?;
            COMPARTMENTS_CLEANED.get_or_init(|| c).clone()
        }
    };
    let purged = match RECORDS_PURGED.get() {
        Some(c) => c.clone(),
        None => {
            let c = IntCounter::new("records_purged_total", "Records purged by cleanup")?;
            RECORDS_PURGED.get_or_init(|| c).clone()
        }
    };
    let sessions = match ACTIVE_SESSIONS.get() {
        Some(g) => g.clone(),
        None => {
            let g = IntGauge::new("active_sessions", "Sessions with a live compartment")?;
            ACTIVE_SESSIONS.get_or_init(|| g).clone()
        }
    };
    let sync_failures = match REMOTE_SYNC_FAILURES.get() {
        Some(c) => c.clone(),
        None => {
            let c = IntCounterVec::new(
                prometheus::opts!(
                    "remote_sync_failures_total",
                    "Remote session store calls that failed after retries"
                ),
                &["operation"],
            )?;
            REMOTE_SYNC_FAILURES.get_or_init(|| c).clone()
        }
    };
    let vault_ops = match VAULT_OPERATIONS.get() {
        Some(c) => c.clone(),
        None => {
            let c = IntCounterVec::new(
                prometheus::opts!("vault_operations_total", "Vault operations by outcome"),
                &["operation", "status"],
            )?;
            VAULT_OPERATIONS.get_or_init(|| c).clone()
        }
    };

    REGISTRY.register(Box::new(created)).ok();
    REGISTRY.register(Box::new(cleaned)).ok();
    REGISTRY.register(Box::new(purged)).ok();
    REGISTRY.register(Box::new(sessions)).ok();
    REGISTRY.register(Box::new(sync_failures)).ok();
    REGISTRY.register(Box::new(vault_ops)).ok();
    Ok(())
}

pub fn inc_compartments_created() {
    if let Some(counter) = COMPARTMENTS_CREATED.get() {
        counter.inc();
    }
}

pub fn inc_compartments_cleaned(reason: &str, records_purged: usize) {
    if let Some(counter) = COMPARTMENTS_CLEANED.get() {
        counter.with_label_values(&[reason]).inc();
    }
    if let Some(counter) = RECORDS_PURGED.get() {
        counter.inc_by(records_purged as u64);
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.set(count as i64);
    }
}

pub fn inc_remote_sync_failure(operation: &str) {
    if let Some(counter) = REMOTE_SYNC_FAILURES.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn inc_vault_operation(operation: &str, status: &str) {
    if let Some(counter) = VAULT_OPERATIONS.get() {
        counter.with_label_values(&[operation, status]).inc();
    }
}

/// Prometheus text exposition of the registry.
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_init() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        inc_compartments_created();
        inc_compartments_cleaned("manual", 3);
        inc_vault_operation("configure", "ok");
        set_active_sessions(2);

        let text = render().unwrap();
        assert!(text.contains("compartments_created_total"));
        assert!(text.contains("records_purged_total"));
        assert!(text.contains("vault_operations_total"));
    }
}
