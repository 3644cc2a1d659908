//! Token streaming
//!
//! Generation reports through a `TokenSink`: any number of tokens, then
//! exactly one of `on_done` or `on_error`. `token_channel` turns that into a
//! stream consumable from async code or a plain thread.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// Streaming token from the generation process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// Generated text piece
    Token(String),
    /// Generation completed (EOS, limit, or cancellation)
    Done,
    /// Generation failed
    Error(String),
}

impl StreamToken {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamToken::Token(_))
    }
}

pub trait TokenSink {
    fn on_token(&mut self, text: &str);
    fn on_done(&mut self);
    fn on_error(&mut self, message: &str);
}

/// Sender half of `token_channel`
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<StreamToken>,
}

impl TokenSink for ChannelSink {
    fn on_token(&mut self, text: &str) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.tx.send(StreamToken::Token(text.to_string()));
    }

    fn on_done(&mut self) {
        let _ = self.tx.send(StreamToken::Done);
    }

    fn on_error(&mut self, message: &str) {
        let _ = self.tx.send(StreamToken::Error(message.to_string()));
    }
}

/// Receiver half of `token_channel`. Ends after the first terminal item.
#[derive(Debug)]
pub struct TokenStream {
    rx: UnboundedReceiver<StreamToken>,
    finished: bool,
}

pub fn token_channel() -> (ChannelSink, TokenStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelSink { tx },
        TokenStream {
            rx,
            finished: false,
        },
    )
}

impl TokenStream {
    fn observe(&mut self, item: Option<StreamToken>) -> Option<StreamToken> {
        match item {
            Some(token) => {
                if token.is_terminal() {
                    self.finished = true;
                }
                Some(token)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    pub async fn recv(&mut self) -> Option<StreamToken> {
        if self.finished {
            return None;
        }
        let item = self.rx.recv().await;
        self.observe(item)
    }

    /// Non-blocking poll. `Ok(None)` means nothing is ready yet.
    pub fn try_recv(&mut self) -> Result<Option<StreamToken>, StreamClosed> {
        if self.finished {
            return Err(StreamClosed);
        }
        match self.rx.try_recv() {
            Ok(token) => Ok(self.observe(Some(token))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                Err(StreamClosed)
            }
        }
    }

    /// Collect the text of every token until the stream ends.
    pub fn collect_text(self) -> (String, Option<StreamToken>) {
        let mut text = String::new();
        let mut terminal = None;
        for token in self {
            match token {
                StreamToken::Token(piece) => text.push_str(&piece),
                other => terminal = Some(other),
            }
        }
        (text, terminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Token stream closed")]
pub struct StreamClosed;

/// Blocking iteration. Must not be used from inside an async runtime.
impl Iterator for TokenStream {
    type Item = StreamToken;

    fn next(&mut self) -> Option<StreamToken> {
        if self.finished {
            return None;
        }
        let item = self.rx.blocking_recv();
        self.observe(item)
    }
}

/// Closure-backed sink
pub struct CallbackSink<T, D, E>
where
    T: FnMut(&str),
    D: FnMut(),
    E: FnMut(&str),
{
    pub on_token: T,
    pub on_done: D,
    pub on_error: E,
}

impl<T, D, E> TokenSink for CallbackSink<T, D, E>
where
    T: FnMut(&str),
    D: FnMut(),
    E: FnMut(&str),
{
    fn on_token(&mut self, text: &str) {
        (self.on_token)(text)
    }

    fn on_done(&mut self) {
        (self.on_done)()
    }

    fn on_error(&mut self, message: &str) {
        (self.on_error)(message)
    }
}
