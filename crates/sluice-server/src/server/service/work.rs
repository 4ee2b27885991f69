use bytes::Bytes;
use core::time::Duration;
use serde::Serialize;
use sluice::{Handler, JobId};

/// Body returned for every processed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkOutput {
    pub request_id: String,
    pub processed: bool,
    /// Size of the request body that was handed to the worker.
    pub bytes: usize,
    /// Unix seconds at completion.
    pub timestamp: i64,
}

/// Stand-in for real per-request work (a query, an upstream call): holds the
/// worker for `delay`, then acknowledges the request.
pub fn simulated_work(delay: Duration) -> impl Handler<Bytes, WorkOutput> {
    move |id: JobId, body: Bytes| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, sluice::Error>(WorkOutput {
            request_id: id.to_string(),
            processed: true,
            bytes: body.len(),
            timestamp: chrono::Utc::now().timestamp(),
        })
    }
}
