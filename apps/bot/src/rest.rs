use anyhow::Context;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use shared::domain::{ChannelId, Message};
use tracing::debug;

#[derive(Debug, Serialize)]
struct CreateMessage<'a> {
    content: &'a str,
    nonce: String,
}

/// The few REST calls the bot needs: posting chat replies.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    api_base: String,
    authorization: String,
}

impl RestClient {
    pub fn new(api_base: impl Into<String>, token: &str) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            authorization: format!("Bot {}", token.trim()),
        }
    }

    pub async fn create_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> anyhow::Result<Message> {
        let nonce = rand::thread_rng().gen::<u64>().to_string();
        debug!(channel_id = %channel_id, nonce = %nonce, "posting message");
        let message = self
            .http
            .post(format!("{}/channels/{channel_id}/messages", self.api_base))
            .header(reqwest::header::AUTHORIZATION, &self.authorization)
            .json(&CreateMessage { content, nonce })
            .send()
            .await
            .with_context(|| format!("failed to post message to channel {channel_id}"))?
            .error_for_status()?
            .json()
            .await
            .context("invalid message in response")?;
        Ok(message)
    }

    /// Posts `content` to the channel `to` was sent in.
    pub async fn reply(&self, to: &Message, content: &str) -> anyhow::Result<Message> {
        self.create_message(&to.channel_id, content).await
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
