use crate::error::FetchError;
use crate::message::{Message, RepairRequest};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

pub type MessageStream = BoxStream<'static, Result<Message, FetchError>>;

/// Storage-side resend service. The returned messages should lie inside the
/// requested range but may be incomplete; anything outside it is ignored.
#[async_trait]
pub trait RepairFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: RepairRequest,
        replica: String,
        cancel: CancellationToken,
    ) -> Result<MessageStream, FetchError>;
}
