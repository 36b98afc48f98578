//! Retriable requests. Each pending interest carries a token; the host reports
//! data, timeouts and network errors against that token. Retries re-express the
//! same token until the attempt budget is spent.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::consumer::OutboundAction;
use crate::error::Error;
use crate::handler::HandlerId;
use crate::name::Name;
use crate::protocol::{Data, Interest};

/// Identifies one logical request across its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn value(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(value: u64) -> Self {
        RequestToken(value)
    }
}

/// Who gets told about the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Owner {
    Handler(HandlerId),
    /// Application-level fetch of a single packet; outcome only touches the node.
    Plain,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingFetch {
    pub interest: Interest,
    pub owner: Owner,
    pub attempts: u32,
    pub max_attempts: u32,
    expressed_tick: u64,
}

/// Outcome of a timeout or network error report.
#[derive(Debug)]
pub(crate) enum RetryOutcome {
    /// Re-expressed; nothing to report yet.
    Retried,
    /// Budget spent. The request is gone from the table.
    Exhausted(PendingFetch, Error),
    /// Token not pending (already completed or cancelled).
    Unknown,
}

pub(crate) struct Fetcher {
    pending: HashMap<RequestToken, PendingFetch>,
    next_token: u64,
    tick_count: u64,
    timeout_ticks: u64,
}

impl Fetcher {
    pub fn new(timeout_ticks: u64) -> Self {
        Self {
            pending: HashMap::new(),
            next_token: 1,
            tick_count: 0,
            timeout_ticks,
        }
    }

    pub fn express(
        &mut self,
        interest: Interest,
        owner: Owner,
        max_attempts: u32,
        out: &mut Vec<OutboundAction>,
    ) -> RequestToken {
        let token = RequestToken(self.next_token);
        self.next_token += 1;
        debug!(token = token.0, name = %interest.name, "express interest");
        out.push(OutboundAction::ExpressInterest {
            token,
            interest: interest.clone(),
        });
        self.pending.insert(
            token,
            PendingFetch {
                interest,
                owner,
                attempts: 1,
                max_attempts: max_attempts.max(1),
                expressed_tick: self.tick_count,
            },
        );
        token
    }

    #[cfg(test)]
    pub fn is_pending(&self, token: RequestToken) -> bool {
        self.pending.contains_key(&token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Complete a request with data. Data that does not answer the interest is
    /// ignored and the request stays pending.
    pub fn complete(&mut self, token: RequestToken, data: &Data) -> Option<PendingFetch> {
        let matches = self.pending.get(&token)?.interest.matches(&data.name);
        if !matches {
            warn!(token = token.0, data = %data.name, "data does not match pending interest");
            return None;
        }
        self.pending.remove(&token)
    }

    /// Lowest token whose interest is answered by `name`.
    pub fn match_name(&self, name: &Name) -> Option<RequestToken> {
        self.pending
            .iter()
            .filter(|(_, p)| p.interest.matches(name))
            .map(|(t, _)| *t)
            .min()
    }

    pub fn on_timeout(&mut self, token: RequestToken, out: &mut Vec<OutboundAction>) -> RetryOutcome {
        self.retry_or_exhaust(token, None, out)
    }

    pub fn on_network_error(
        &mut self,
        token: RequestToken,
        reason: &str,
        out: &mut Vec<OutboundAction>,
    ) -> RetryOutcome {
        self.retry_or_exhaust(token, Some(reason), out)
    }

    fn retry_or_exhaust(
        &mut self,
        token: RequestToken,
        network_reason: Option<&str>,
        out: &mut Vec<OutboundAction>,
    ) -> RetryOutcome {
        let Some(pending) = self.pending.get_mut(&token) else {
            return RetryOutcome::Unknown;
        };
        if pending.attempts < pending.max_attempts {
            pending.attempts += 1;
            pending.expressed_tick = self.tick_count;
            debug!(
                token = token.0,
                name = %pending.interest.name,
                attempt = pending.attempts,
                "re-express interest"
            );
            out.push(OutboundAction::ExpressInterest {
                token,
                interest: pending.interest.clone(),
            });
            return RetryOutcome::Retried;
        }
        let Some(pending) = self.pending.remove(&token) else {
            return RetryOutcome::Unknown;
        };
        let name = pending.interest.name.clone();
        let attempts = pending.attempts;
        let error = match network_reason {
            Some(reason) => Error::FetchNetworkError {
                name,
                attempts,
                reason: reason.to_string(),
            },
            None => Error::FetchTimeout { name, attempts },
        };
        warn!(token = token.0, %error, "request exhausted retries");
        RetryOutcome::Exhausted(pending, error)
    }

    /// Advance the clock; requests older than the timeout are treated as timed out.
    pub fn tick(&mut self, out: &mut Vec<OutboundAction>) -> Vec<(RequestToken, PendingFetch, Error)> {
        self.tick_count = self.tick_count.saturating_add(1);
        let mut expired: Vec<RequestToken> = self
            .pending
            .iter()
            .filter(|(_, p)| self.tick_count.saturating_sub(p.expressed_tick) > self.timeout_ticks)
            .map(|(t, _)| *t)
            .collect();
        expired.sort();
        let mut exhausted = Vec::new();
        for token in expired {
            if let RetryOutcome::Exhausted(pending, error) = self.on_timeout(token, out) {
                exhausted.push((token, pending, error));
            }
        }
        exhausted
    }

    /// Drop a request. Late completions for it become no-ops.
    pub fn cancel(&mut self, token: RequestToken, out: &mut Vec<OutboundAction>) -> bool {
        if self.pending.remove(&token).is_some() {
            debug!(token = token.0, "cancel interest");
            out.push(OutboundAction::CancelInterest(token));
            true
        } else {
            false
        }
    }

    pub fn cancel_owner(&mut self, owner: Owner, out: &mut Vec<OutboundAction>) -> usize {
        let mut tokens: Vec<RequestToken> = self
            .pending
            .iter()
            .filter(|(_, p)| p.owner == owner)
            .map(|(t, _)| *t)
            .collect();
        tokens.sort();
        for &token in &tokens {
            self.cancel(token, out);
        }
        tokens.len()
    }

    pub fn cancel_all(&mut self, out: &mut Vec<OutboundAction>) {
        let mut tokens: Vec<RequestToken> = self.pending.keys().copied().collect();
        tokens.sort();
        for token in tokens {
            self.cancel(token, out);
        }
    }
}
