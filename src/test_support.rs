//! Shared fixtures for unit tests: a scripted model sender and sample HR content.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::anthropic::{
    AnthropicError, ContentBlock, MessageSender, MessagesRequest, MessagesResponse, Usage,
};
use crate::pipeline::Chunk;

/// Replays a fixed list of replies in order, then either repeats a fallback reply or
/// fails with a 500. Counts every call and keeps the prompts it saw.
pub struct ScriptedSender {
    replies: Mutex<VecDeque<Result<String, AnthropicError>>>,
    fallback: Option<Result<String, AnthropicError>>,
    delay: Option<Duration>,
    calls: AtomicU32,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedSender {
    pub fn new(replies: Vec<Result<String, AnthropicError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            delay: None,
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: Result<String, AnthropicError>) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn next_reply(&self) -> Result<String, AnthropicError> {
        if let Some(reply) = self.replies.lock().pop_front() {
            return reply;
        }
        match &self.fallback {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(e)) => Err(copy_error(e)),
            None => Err(AnthropicError::ApiError {
                status: 500,
                message: "script exhausted".into(),
            }),
        }
    }
}

fn copy_error(e: &AnthropicError) -> AnthropicError {
    match e {
        AnthropicError::RateLimited { retry_after_ms } => AnthropicError::RateLimited {
            retry_after_ms: *retry_after_ms,
        },
        AnthropicError::ApiError { status, message } => AnthropicError::ApiError {
            status: *status,
            message: message.clone(),
        },
        AnthropicError::Timeout(d) => AnthropicError::Timeout(*d),
        AnthropicError::EmptyResponse => AnthropicError::EmptyResponse,
        AnthropicError::NetworkError(err) => AnthropicError::ApiError {
            status: 503,
            message: err.to_string(),
        },
    }
}

pub fn text_response(text: &str) -> MessagesResponse {
    MessagesResponse {
        id: "msg_test".into(),
        content: vec![ContentBlock {
            content_type: "text".into(),
            text: text.to_string(),
        }],
        model: "test".into(),
        stop_reason: Some("end_turn".into()),
        usage: Usage {
            input_tokens: 0,
            output_tokens: 0,
        },
    }
}

#[async_trait]
impl MessageSender for ScriptedSender {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = req.messages.first() {
            self.prompts.lock().push(msg.content.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_reply().map(|text| text_response(&text))
    }
}

/// Three chunks of HR onboarding material.
pub fn hr_chunks() -> Vec<Chunk> {
    vec![
        Chunk::new(
            "hr-1",
            "Onboarding is the process of integrating new employees into the organization. \
             A structured onboarding program lasts 90 days and assigns every new hire a mentor.",
        )
        .with_heading("Employee Onboarding"),
        Chunk::new(
            "hr-2",
            "Performance reviews happen twice a year. Managers rate each employee against \
             agreed objectives and document feedback in the performance review form.",
        )
        .with_heading("Performance Reviews"),
        Chunk::new(
            "hr-3",
            "Employees accrue 25 days of annual leave. Leave requests must be approved by \
             the line manager at least 14 days in advance.",
        )
        .with_heading("Leave Policy"),
    ]
}
