use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::Token;

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Granted immediately; the token is active.
    Acquired(Token),
    /// Appended to the wait list; a later grant will report the token.
    Queued(Token),
}

impl AcquireOutcome {
    pub fn token(&self) -> &Token {
        match self {
            Self::Acquired(token) | Self::Queued(token) => token,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// State change produced by a release or an expiry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Tokens removed from the active set or the wait list.
    pub released: Vec<Token>,
    /// Waiters promoted to active, in wait-list order.
    pub granted: Vec<Token>,
    /// Nothing active and nothing waiting: the stub can be evicted.
    pub idle: bool,
}

/// Exclusive/shared lock state of one resource.
///
/// The active set is empty, exactly one exclusive token, or any number of shared
/// tokens. A single deadline covers the whole active batch and is re-armed on
/// every grant; it is cleared whenever the active set empties.
#[derive(Debug, Clone)]
pub struct ResourceStub {
    resource_id: String,
    exclusive: bool,
    active: Vec<Token>,
    waiting: VecDeque<Token>,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl ResourceStub {
    pub fn new(resource_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            resource_id: resource_id.into(),
            exclusive: false,
            active: Vec::new(),
            waiting: VecDeque::new(),
            deadline: None,
            timeout,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn active(&self) -> &[Token] {
        &self.active
    }

    pub fn waiting(&self) -> impl Iterator<Item = &Token> {
        self.waiting.iter()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.waiting.is_empty()
    }

    pub fn acquire(
        &mut self,
        exclusive: bool,
        credential: &str,
        sequence: u64,
        now: Instant,
    ) -> AcquireOutcome {
        let token = Token::new(sequence, exclusive, credential);
        let grant = if exclusive {
            self.active.is_empty()
        } else {
            // A queued exclusive request is a barrier for later shared ones.
            !self.exclusive && self.waiting.front().is_none_or(|head| !head.exclusive)
        };

        if grant {
            self.activate(token.clone());
            self.deadline = Some(now + self.timeout);
            AcquireOutcome::Acquired(token)
        } else {
            self.waiting.push_back(token.clone());
            AcquireOutcome::Queued(token)
        }
    }

    /// Remove `tokens` wherever they are, then promote waiters.
    pub fn release(&mut self, tokens: &[Token], now: Instant) -> Transition {
        let mut released = Vec::new();
        for token in tokens {
            if let Some(pos) = self.active.iter().position(|t| t == token) {
                released.push(self.active.swap_remove(pos));
            } else if let Some(pos) = self.waiting.iter().position(|t| t == token) {
                released.extend(self.waiting.remove(pos));
            }
        }
        if self.active.is_empty() {
            self.exclusive = false;
        }
        self.settle(released, now)
    }

    /// Force-clear the active batch if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<Transition> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        let released = std::mem::take(&mut self.active);
        self.exclusive = false;
        Some(self.settle(released, now))
    }

    fn settle(&mut self, released: Vec<Token>, now: Instant) -> Transition {
        let granted = self.promote();
        if self.active.is_empty() {
            self.deadline = None;
        } else if !granted.is_empty() {
            self.deadline = Some(now + self.timeout);
        }
        Transition {
            released,
            granted,
            idle: self.is_idle(),
        }
    }

    fn promote(&mut self) -> Vec<Token> {
        let mut granted = Vec::new();
        if self.active.is_empty()
            && let Some(head) = self.waiting.front()
            && head.exclusive
        {
            granted.extend(self.waiting.pop_front());
        }
        if granted.is_empty() && !self.exclusive {
            while let Some(head) = self.waiting.front()
                && !head.exclusive
            {
                granted.extend(self.waiting.pop_front());
            }
        }
        for token in &granted {
            self.activate(token.clone());
        }
        granted
    }

    fn activate(&mut self, token: Token) {
        self.exclusive = token.exclusive;
        self.active.push(token);
    }
}
