//! Scripted generator — a deterministic token-stream backend.
//!
//! Plays back canned responses as chunked streams, in the order queued or
//! keyed by a prompt substring. Used by the loop's tests and demos the way
//! the loop uses a real model: each phase gets its own response, delivered
//! a few characters at a time so streaming consumers are genuinely
//! exercised.

use async_trait::async_trait;
use delver_core::error::GenerateError;
use delver_core::{GenChunk, GenerateRequest, Generator, Usage};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A generator that returns scripted responses.
///
/// Keyed responses (matched by substring against the request's system or
/// user prompt) are reusable and checked first; otherwise the next queued
/// response is consumed. A queued `Err` entry fails the `generate` call
/// itself, which lets tests drive the loop's fatal paths.
pub struct ScriptedGenerator {
    keyed: Vec<(String, String)>,
    queue: Mutex<VecDeque<Result<String, GenerateError>>>,
    chunk_size: usize,
    call_count: Mutex<usize>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<Result<String, GenerateError>>) -> Self {
        Self {
            keyed: Vec::new(),
            queue: Mutex::new(responses.into()),
            chunk_size: 16,
            call_count: Mutex::new(0),
        }
    }

    /// A generator that answers every call from the queue of texts.
    pub fn sequence<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| Ok(t.into())).collect())
    }

    /// A generator that returns one text response.
    pub fn single(text: impl Into<String>) -> Self {
        Self::sequence([text.into()])
    }

    /// Add a reusable response served whenever `pattern` occurs in the
    /// request's system or user prompt.
    pub fn with_keyed_response(
        mut self,
        pattern: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.keyed.push((pattern.into(), response.into()));
        self
    }

    /// Override the stream chunk size (characters per chunk).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// How many generations have been requested.
    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    fn next_response(&self, request: &GenerateRequest) -> Result<String, GenerateError> {
        for (pattern, response) in &self.keyed {
            if request.prompt.contains(pattern) || request.system.contains(pattern) {
                return Ok(response.clone());
            }
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(GenerateError::NotConfigured(
                    "no scripted response remaining".into(),
                ))
            })
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<mpsc::Receiver<Result<GenChunk, GenerateError>>, GenerateError> {
        *self.call_count.lock().unwrap() += 1;
        let text = self.next_response(&request)?;
        let chunk_size = self.chunk_size;
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let chars: Vec<char> = text.chars().collect();
            for window in chars.chunks(chunk_size) {
                let piece: String = window.iter().collect();
                if tx.send(Ok(GenChunk::text(piece))).await.is_err() {
                    return;
                }
            }
            let completion_tokens = (chars.len() / 4).max(1) as u32;
            let _ = tx
                .send(Ok(GenChunk::done(Some(Usage {
                    prompt_tokens: 10,
                    completion_tokens,
                    total_tokens: 10 + completion_tokens,
                }))))
                .await;
        });

        Ok(rx)
    }
}
