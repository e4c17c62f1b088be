use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, Encoder, IntCounterVec, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "notiflow_executions_total",
        "Workflow execution transitions by resulting status.",
        &["status"],
        REGISTRY
    )
    .expect("executions counter registers once");

    pub static ref STEPS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "notiflow_steps_total",
        "Terminal step outcomes by step type and status.",
        &["step_type", "status"],
        REGISTRY
    )
    .expect("steps counter registers once");

    pub static ref STEP_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "notiflow_step_retries_total",
        "Step retries scheduled after a transient failure.",
        &["step_type"],
        REGISTRY
    )
    .expect("retries counter registers once");

    pub static ref SWEEP_RESUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "notiflow_sweep_resubmissions_total",
        "Jobs submitted by the scheduler sweeps, by sweep.",
        &["sweep"],
        REGISTRY
    )
    .expect("sweep counter registers once");

    pub static ref POOL_JOBS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "notiflow_pool_jobs_total",
        "Worker pool jobs by outcome.",
        &["outcome"],
        REGISTRY
    )
    .expect("pool counter registers once");
}

// Function to gather metrics for exposition
pub fn gather_metrics() -> crate::Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| crate::Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| crate::Error::Internal(format!("Failed to convert metrics to string: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_counters() {
        EXECUTIONS_TOTAL.with_label_values(&["started"]).inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("notiflow_executions_total"));
    }
}
