pub mod committer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fs;
pub mod hooks;
pub mod job;
pub mod job_commit;
pub mod mapreduce;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod results;
pub mod task;
pub mod wordcount;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Configuration;
pub use error::{CommitError, Result};
pub use fs::{FileSystem, LocalFileSystem};
pub use job::{JobContext, JobId, JobState};
pub use job_commit::JobCommitReport;
pub use message::TaskCommitMessage;
pub use protocol::FileCommitProtocol;
pub use registry::{CommitProtocolRegistry, ProtocolArgs, ProtocolSpec};
pub use task::{TaskAttemptContext, TaskId, TaskState};
