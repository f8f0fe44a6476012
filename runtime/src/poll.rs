//! Readiness and liveness polling.
//!
//! A poll sends one boolean query, reads one reply, and sleeps for the
//! configured interval unless the wanted sentinel came back. Only the
//! exact `True` / `False` byte strings count; anything else is treated as
//! "not yet" up to the policy's tolerance.

use opennet_core::config::PollPolicy;
use opennet_core::error::{NetError, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{cancellable_sleep, AgentChannel};
use crate::script::{Statement, FALSE_SENTINEL, TRUE_SENTINEL};

/// Classification of one query reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    True,
    False,
    Unrecognized,
}

impl ReplyClass {
    pub fn classify(reply: &[u8]) -> Self {
        if reply == TRUE_SENTINEL {
            ReplyClass::True
        } else if reply == FALSE_SENTINEL {
            ReplyClass::False
        } else {
            ReplyClass::Unrecognized
        }
    }
}

/// Poll until `query` evaluates to true. Returns the number of queries sent.
pub async fn wait_until(
    channel: &mut AgentChannel,
    query: &Statement,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<u32> {
    poll_for(channel, query, ReplyClass::True, policy, cancel).await
}

/// Poll until `query` evaluates to false. Returns the number of queries sent.
pub async fn wait_while(
    channel: &mut AgentChannel,
    query: &Statement,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<u32> {
    poll_for(channel, query, ReplyClass::False, policy, cancel).await
}

/// Ask `query` once and return its boolean answer. Unrecognized replies
/// are re-asked within the same tolerance as a poll.
pub async fn ask(
    channel: &mut AgentChannel,
    query: &Statement,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<bool> {
    let deadline = policy.timeout().map(|t| Instant::now() + t);
    let mut unrecognized = 0u32;
    loop {
        match request(channel, query, policy, deadline, cancel).await? {
            ReplyClass::True => return Ok(true),
            ReplyClass::False => return Ok(false),
            ReplyClass::Unrecognized => {
                unrecognized += 1;
                check_tolerance(unrecognized, policy)?;
                pause(policy, deadline, cancel).await?;
            }
        }
    }
}

async fn poll_for(
    channel: &mut AgentChannel,
    query: &Statement,
    want: ReplyClass,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<u32> {
    let deadline = policy.timeout().map(|t| Instant::now() + t);
    let mut polls = 0u32;
    let mut unrecognized = 0u32;

    loop {
        polls += 1;
        let class = request(channel, query, policy, deadline, cancel).await?;
        tracing::trace!(polls, reply = ?class, "Poll reply");

        if class == want {
            return Ok(polls);
        }
        if class == ReplyClass::Unrecognized {
            unrecognized += 1;
            check_tolerance(unrecognized, policy)?;
        } else {
            unrecognized = 0;
        }
        pause(policy, deadline, cancel).await?;
    }
}

/// One request/reply, bounded by the deadline and cancellation.
async fn request(
    channel: &mut AgentChannel,
    query: &Statement,
    policy: &PollPolicy,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<ReplyClass> {
    let exchange = channel.request(query, policy.recv_buffer);
    let reply = tokio::select! {
        _ = cancel.cancelled() => return Err(cancelled(query)),
        reply = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, exchange)
                    .await
                    .map_err(|_| timed_out(query, policy))?,
                None => exchange.await,
            }
        } => reply?,
    };
    Ok(ReplyClass::classify(&reply.bytes))
}

async fn pause(
    policy: &PollPolicy,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut delay = policy.interval();
    if let Some(deadline) = deadline {
        let now = Instant::now();
        if now >= deadline {
            return Err(NetError::Timeout(format!(
                "poll gave up after {:?}",
                policy.timeout().unwrap_or_default()
            )));
        }
        delay = delay.min(deadline - now);
    }
    cancellable_sleep(delay, cancel)
        .await
        .map_err(|_| NetError::Cancelled("poll".to_string()))
}

fn check_tolerance(unrecognized: u32, policy: &PollPolicy) -> Result<()> {
    // 0 disables the limit
    if policy.max_unrecognized_replies > 0 && unrecognized >= policy.max_unrecognized_replies {
        return Err(NetError::Protocol(format!(
            "{} consecutive replies were neither True nor False",
            unrecognized
        )));
    }
    Ok(())
}

fn cancelled(query: &Statement) -> NetError {
    NetError::Cancelled(format!("poll of {}", describe(query)))
}

fn timed_out(query: &Statement, policy: &PollPolicy) -> NetError {
    NetError::Timeout(format!(
        "{} not answered within {:?}",
        describe(query),
        policy.timeout().unwrap_or_default()
    ))
}

fn describe(query: &Statement) -> String {
    match query {
        Statement::Query { condition } => condition
            .render()
            .unwrap_or_else(|_| "query".to_string()),
        _ => "statement".to_string(),
    }
}
