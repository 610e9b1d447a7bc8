use async_trait::async_trait;

use crate::{
    domain::{ChatId, SenderId},
    Result,
};

/// What the reply generator needs to answer one admitted message.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplyRequest {
    pub chat_id: ChatId,
    pub sender: SenderId,
    pub sender_name: Option<String>,
    pub text: String,
    pub is_group: bool,
}

/// Port for the external text-generation service.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, req: &ReplyRequest) -> Result<String>;
}
