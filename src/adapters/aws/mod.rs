//! AWS adapters: S3 (or R2) objects, SQS FIFO jobs, DynamoDB status.

pub mod dynamodb;
pub mod s3;
pub mod sqs;

pub use dynamodb::DynamoStatusStore;
pub use s3::S3ObjectStore;
pub use sqs::SqsQueue;
