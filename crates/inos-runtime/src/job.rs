//! Job and result wire records.
//!
//! Records are serde-serialised; the ring transport's length prefix is the
//! outer framing, so the encoded bytes go straight into a frame. `params` is
//! an opaque bag understood only by the handling capability — the core
//! forwards it verbatim and never parses it.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

/// A job as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    /// Capability (library) expected to execute this job.
    pub library: String,
    pub method: String,
    #[serde(default)]
    pub input: Vec<u8>,
    /// Opaque, forwarded verbatim.
    #[serde(default)]
    pub params: Vec<u8>,
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        library: impl Into<String>,
        method: impl Into<String>,
        input: Vec<u8>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            library: library.into(),
            method: method.into(),
            input,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<u8>) -> Self {
        self.params = params;
        self
    }
}

/// Terminal status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
}

/// A job result as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub output: Vec<u8>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub execution_time_ns: u64,
}

impl ResultRecord {
    pub fn success(job_id: impl Into<String>, output: Vec<u8>, execution_time_ns: u64) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Success,
            output,
            error_message: String::new(),
            execution_time_ns,
        }
    }

    pub fn failure(job_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Failed,
            output: Vec::new(),
            error_message: error_message.into(),
            execution_time_ns: 0,
        }
    }

    /// Returns `true` for successful results.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// A submittable job: a wire record plus a mandatory absolute deadline.
///
/// Deadline-less jobs do not exist — construction requires one.
#[derive(Debug, Clone)]
pub struct Job {
    pub record: JobRecord,
    pub deadline: Instant,
}

impl Job {
    pub fn new(record: JobRecord, deadline: Instant) -> Self {
        Self { record, deadline }
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(record: JobRecord, timeout: Duration) -> Self {
        Self {
            record,
            deadline: Instant::now() + timeout,
        }
    }

    /// Returns `true` once the deadline has passed.
    #[inline]
    pub fn expired(&self) -> bool {
        Instant::now() > self.deadline
    }
}

/// Malformed wire payloads. The offending job is failed, never retried.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed wire payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Encodes a job record for the ring.
pub fn encode_job(record: &JobRecord) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(record)?)
}

/// Decodes a job record from a ring frame.
pub fn decode_job(bytes: &[u8]) -> Result<JobRecord, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encodes a result record for the ring.
pub fn encode_result(record: &ResultRecord) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(record)?)
}

/// Decodes a result record from a ring frame.
pub fn decode_result(bytes: &[u8]) -> Result<ResultRecord, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_record_roundtrip() {
        let record = JobRecord::new("job-1", "hashing", "sha256", vec![1, 2, 3])
            .with_params(vec![9, 9]);
        let bytes = encode_job(&record).unwrap();
        assert_eq!(decode_job(&bytes).unwrap(), record);
    }

    #[test]
    fn result_record_roundtrip() {
        let record = ResultRecord::success("job-1", vec![0xAA], 1234);
        let bytes = encode_result(&record).unwrap();
        assert_eq!(decode_result(&bytes).unwrap(), record);

        let failed = ResultRecord::failure("job-2", "unsupported capability: physics");
        let bytes = encode_result(&failed).unwrap();
        let decoded = decode_result(&bytes).unwrap();
        assert!(!decoded.is_success());
        assert_eq!(decoded.error_message, "unsupported capability: physics");
    }

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        assert!(matches!(
            decode_job(b"{\"job_id\": 42}"),
            Err(WireError::Serialization(_))
        ));
        assert!(decode_result(b"not json at all").is_err());
    }

    #[test]
    fn params_survive_verbatim() {
        let params: Vec<u8> = (0..=255).collect();
        let record = JobRecord::new("job-3", "physics", "step", vec![]).with_params(params.clone());
        let decoded = decode_job(&encode_job(&record).unwrap()).unwrap();
        assert_eq!(decoded.params, params);
    }

    #[test]
    fn deadlines_are_mandatory_and_observable() {
        let job = Job::with_timeout(JobRecord::new("j", "lib", "m", vec![]), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(job.expired());
    }
}
