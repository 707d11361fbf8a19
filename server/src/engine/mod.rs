pub mod batch_writer;
pub mod broadcast;
pub mod channel;
pub mod channel_manager;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod hub;
pub mod raster;
pub mod rate_limiter;
pub mod rle;
pub mod sketch;
pub mod validation;

use std::future::Future;
use std::time::Duration;

use crate::error::CoreResult;

/// Run a store operation under the caller's deadline. Dropping the future on
/// timeout rolls back any open transaction.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    tokio::time::timeout(deadline, fut).await?
}
