//! Language-model completion: the [`Completer`] trait, prompts and token
//! streams, and an OpenAI-compatible chat client.

use std::io::{BufRead, BufReader, Lines};

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    error::{Error, Result},
    http,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that \
answers questions using the information provided to you. Answer accurately \
and helpfully. If the information is not enough to answer, say so clearly.";

/// One stateless completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    /// Retrieved chunks joined by blank lines. May be empty.
    pub context: String,
    pub query: String,
}

impl Prompt {
    pub fn new(
        system: impl Into<String>,
        context: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            context: context.into(),
            query: query.into(),
        }
    }

    /// The user turn sent to the model. Without context it is the bare
    /// query.
    ///
    /// # Examples
    ///
    /// ```
    /// use docrag::completion::Prompt;
    ///
    /// let prompt = Prompt::new("sys", "", "What is Rust?");
    /// assert_eq!(prompt.user_message(), "What is Rust?");
    ///
    /// let prompt = Prompt::new("sys", "Rust is a language.", "What is Rust?");
    /// assert!(prompt.user_message().contains("Rust is a language."));
    /// ```
    pub fn user_message(&self) -> String {
        if self.context.trim().is_empty() {
            self.query.clone()
        } else {
            format!(
                "Based on the following:\n\n{}\n\nAnswer the question: {}",
                self.context, self.query
            )
        }
    }
}

/// Incremental answer text, in generation order.
///
/// A stream is consumed once; it cannot be cloned or rewound. A failure
/// is reported as a single `Err` item, after which the stream ends.
pub struct TokenStream {
    inner: Box<dyn Iterator<Item = Result<String>> + Send>,
}

impl TokenStream {
    pub fn new(
        tokens: impl Iterator<Item = Result<String>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::new(tokens),
        }
    }

    /// Drain the stream into one string, stopping at the first error.
    pub fn collect_text(self) -> Result<String> {
        self.collect()
    }
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream").finish_non_exhaustive()
    }
}

/// A language model answering prompts.
pub trait Completer: Send {
    fn model_name(&self) -> &str;

    fn complete(&self, prompt: &Prompt) -> Result<String>;

    fn complete_stream(&self, prompt: &Prompt) -> Result<TokenStream>;

    /// Release any remote resources. Called once at shutdown.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionConfig {
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            base_url: http::OPENAI_BASE_URL.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            timeout_secs: 120,
        }
    }
}

impl CompletionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("completion.model must be set".into()));
        }
        if self.max_tokens == 0 {
            return Err(Error::Config(
                "completion.max_tokens must be > 0".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Config(format!(
                "completion.temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "completion.timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

pub struct OpenAiCompleter {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            url: http::endpoint(&config.base_url, "chat/completions"),
            model: config.model.clone(),
            api_key: http::api_key(&config.api_key_env, &config.base_url)?,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request_body(&self, prompt: &Prompt, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user_message() },
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": stream,
        })
    }
}

impl Completer for OpenAiCompleter {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn complete(&self, prompt: &Prompt) -> Result<String> {
        let response = http::post_json(
            &self.client,
            &self.url,
            self.api_key.as_deref(),
            &self.request_body(prompt, false),
            0,
            Error::Completion,
        )?;
        let parsed: ChatResponse = response
            .json()
            .map_err(|e| Error::Completion(format!("bad response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Completion("response has no content".into()))
    }

    fn complete_stream(&self, prompt: &Prompt) -> Result<TokenStream> {
        let response = http::post_json(
            &self.client,
            &self.url,
            self.api_key.as_deref(),
            &self.request_body(prompt, true),
            0,
            Error::Completion,
        )?;
        Ok(TokenStream::new(SseTokens::new(BufReader::new(response))))
    }

    fn close(&mut self) -> Result<()> {
        debug!(model = %self.model, "completion client closed");
        Ok(())
    }
}

/// Decodes `data:` lines of a server-sent-event chat stream into content
/// deltas, ending at `[DONE]`.
struct SseTokens<R> {
    lines: Lines<R>,
    done: bool,
}

impl<R: BufRead> SseTokens<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            done: false,
        }
    }

    fn fail(&mut self, message: String) -> Option<Result<String>> {
        self.done = true;
        Some(Err(Error::Completion(message)))
    }
}

impl<R: BufRead> Iterator for SseTokens<R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    return self.fail(format!("stream interrupted: {e}"));
                }
                Some(Ok(line)) => line,
            };

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                return None;
            }

            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    let text = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .unwrap_or_default();
                    if !text.is_empty() {
                        return Some(Ok(text));
                    }
                }
                Err(e) => return self.fail(format!("bad stream event: {e}")),
            }
        }
        None
    }
}

/// Build the configured completer.
pub fn create_completer(
    config: &CompletionConfig,
) -> Result<Box<dyn Completer>> {
    config.validate()?;
    Ok(Box::new(OpenAiCompleter::new(config)?))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::http::testing::serve;

    fn local_config(base_url: &str) -> CompletionConfig {
        CompletionConfig {
            base_url: base_url.to_string(),
            api_key_env: "DOCRAG_TEST_COMPLETION_KEY_UNSET".to_string(),
            ..CompletionConfig::default()
        }
    }

    fn sse(events: &[&str]) -> String {
        events.iter().map(|e| format!("data: {e}\n\n")).collect()
    }

    fn delta(text: &str) -> String {
        serde_json::json!({ "choices": [{ "delta": { "content": text } }] })
            .to_string()
    }

    #[test]
    fn user_message_embeds_context() {
        let prompt = Prompt::new("sys", "chunk one\n\nchunk two", "why?");
        assert_eq!(
            prompt.user_message(),
            "Based on the following:\n\nchunk one\n\nchunk two\n\n\
             Answer the question: why?"
        );
    }

    #[test]
    fn sse_yields_deltas_in_order_until_done() {
        let body = sse(&[
            delta("Hel").as_str(),
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            delta("lo").as_str(),
            "[DONE]",
            delta("ignored").as_str(),
        ]);
        let tokens: Vec<String> = SseTokens::new(Cursor::new(body))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(tokens, vec!["Hel", "lo"]);
    }

    #[test]
    fn sse_reports_one_error_then_ends() {
        let body = sse(&[
            delta("ok").as_str(),
            "{not json",
            delta("never").as_str(),
        ]);
        let mut tokens = SseTokens::new(Cursor::new(body));

        assert_eq!(tokens.next().unwrap().unwrap(), "ok");
        assert!(matches!(tokens.next(), Some(Err(Error::Completion(_)))));
        assert!(tokens.next().is_none());
    }

    #[test]
    fn token_stream_is_consumed_once() {
        let mut stream = TokenStream::new(
            vec![Ok("a".to_string()), Ok("b".to_string())].into_iter(),
        );
        assert_eq!(stream.next().unwrap().unwrap(), "a");
        assert_eq!(stream.collect_text().unwrap(), "b");
    }

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let config = CompletionConfig {
            temperature: 3.0,
            ..CompletionConfig::default()
        };
        assert!(config.validate().is_err());
        CompletionConfig::default().validate().unwrap();
    }

    #[test]
    fn complete_against_a_compatible_server() {
        let body = r#"{"choices":[{"message":{"content":"42"}}]}"#;
        let (base, server) =
            serve(vec![(200, "application/json", body.to_string())]);

        let completer = OpenAiCompleter::new(&local_config(&base)).unwrap();
        let answer = completer
            .complete(&Prompt::new("be brief", "ctx", "meaning?"))
            .unwrap();
        assert_eq!(answer, "42");

        let requests = server.join().unwrap();
        let sent: serde_json::Value =
            serde_json::from_str(&requests[0]).unwrap();
        assert_eq!(sent["messages"][0]["content"], "be brief");
        assert_eq!(sent["max_tokens"], 1000);
        assert_eq!(sent["stream"], false);
    }

    #[test]
    fn stream_against_a_compatible_server() {
        let body =
            sse(&[delta("4").as_str(), delta("2").as_str(), "[DONE]"]);
        let (base, server) = serve(vec![(200, "text/event-stream", body)]);

        let completer = OpenAiCompleter::new(&local_config(&base)).unwrap();
        let text = completer
            .complete_stream(&Prompt::new("sys", "", "meaning?"))
            .unwrap()
            .collect_text()
            .unwrap();
        assert_eq!(text, "42");
        server.join().unwrap();
    }
}
