pub mod progress;
pub mod retry;

pub use progress::{percent_of, format_bytes, format_duration};
pub use retry::{RetryPolicy, RetryStrategy};
