//! Continuation-first command routing for chat messages.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::gateway::correlator::BotApi;
use crate::gateway::dispatcher::{EventContext, Propagation};
use crate::models::{ApiResponse, MessageEvent};
use crate::permissions::{is_permitted, Permission, Role};
use crate::service::ServiceRecord;

use super::descriptor::CommandDescriptor;
use super::waiter::{ResolveOutcome, WaitRegistry, WaitRequest, WaitResult};

/// What the router did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to a pending continuation.
    Continuation,
    /// A command handled it.
    Handled { command: String, propagation: Propagation },
    /// Nothing claimed it; generic subscribers see it next.
    NoMatch,
}

impl RouteOutcome {
    /// Whether subscribers should still see the event.
    pub fn continues(&self) -> bool {
        match self {
            Self::Continuation => false,
            Self::Handled { propagation, .. } => *propagation == Propagation::Continue,
            Self::NoMatch => true,
        }
    }
}

/// What a command handler receives.
pub struct CommandContext {
    pub event: Arc<EventContext>,
    pub message: MessageEvent,
    /// Capture groups of the matched pattern; index 0 is the whole match.
    pub captures: Vec<Option<String>>,
    pub matched: String,
    waits: Arc<WaitRegistry>,
}

impl CommandContext {
    pub fn bot(&self) -> &BotApi {
        &self.event.bot
    }

    pub fn capture(&self, index: usize) -> Option<&str> {
        self.captures.get(index)?.as_deref()
    }

    /// Answer in the conversation the command came from.
    pub async fn reply(&self, message: impl Into<Value>) -> ApiResponse {
        self.event.bot.reply(&self.message, message).await
    }

    /// Wait for the next message from the same conversation that matches
    /// any of `expressions`.
    pub async fn wait_next<I, S>(&self, expressions: I, timeout: Duration) -> WaitResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wait(WaitRequest::new(
            self.event.service_id.clone(),
            self.message.source_key(),
            expressions,
            timeout,
        ))
        .await
    }

    pub async fn wait(&self, request: WaitRequest) -> WaitResult {
        self.waits.register_wait(request).await
    }
}

pub struct CommandRouter {
    commands: Arc<[CommandDescriptor]>,
    waits: Arc<WaitRegistry>,
}

pub struct RouterBuilder {
    commands: Vec<CommandDescriptor>,
    waits: Option<Arc<WaitRegistry>>,
}

impl RouterBuilder {
    pub fn register(mut self, command: CommandDescriptor) -> Self {
        self.commands.push(command);
        self
    }

    /// Share an existing continuation table. A fresh one is used otherwise.
    pub fn waits(mut self, waits: Arc<WaitRegistry>) -> Self {
        self.waits = Some(waits);
        self
    }

    pub fn build(mut self) -> CommandRouter {
        // Stable: equal priorities keep registration order.
        self.commands.sort_by_key(|command| Reverse(command.priority));
        CommandRouter {
            commands: self.commands.into(),
            waits: self.waits.unwrap_or_default(),
        }
    }
}

impl CommandRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            commands: Vec::new(),
            waits: None,
        }
    }

    pub fn waits(&self) -> &Arc<WaitRegistry> {
        &self.waits
    }

    /// Command names in evaluation order.
    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(|c| c.name.as_str())
    }

    pub async fn route(&self, ctx: &Arc<EventContext>, message: &MessageEvent, service: &ServiceRecord) -> RouteOutcome {
        match self.waits.try_resolve(&service.service_id, message) {
            ResolveOutcome::Delivered => return RouteOutcome::Continuation,
            ResolveOutcome::AlreadyClaimed => return RouteOutcome::NoMatch,
            ResolveOutcome::NoWaiter => {}
        }

        let text = message.text();
        let is_super_user = service.is_super_user(message.user_id);
        let mut role: Option<Role> = None;

        for command in self.commands.iter() {
            if !command.admits(message) {
                continue;
            }
            let Some(matched) = command.match_text(&text) else {
                continue;
            };
            if !self.permitted(command, ctx, message, is_super_user, &mut role).await {
                tracing::debug!(
                    command = %command.name,
                    user_id = message.user_id,
                    "command denied"
                );
                continue;
            }

            ctx.set_matched(&matched.expression);
            tracing::debug!(
                command = %command.name,
                expression = %matched.expression,
                connection_id = %ctx.connection_id,
                "command matched"
            );
            let propagation = command
                .handler
                .handle(CommandContext {
                    event: ctx.clone(),
                    message: message.clone(),
                    captures: matched.captures,
                    matched: matched.expression,
                    waits: self.waits.clone(),
                })
                .await;
            return RouteOutcome::Handled {
                command: command.name.clone(),
                propagation,
            };
        }
        RouteOutcome::NoMatch
    }

    /// `role` caches the sender's role across descriptors of one message.
    async fn permitted(
        &self,
        command: &CommandDescriptor,
        ctx: &EventContext,
        message: &MessageEvent,
        is_super_user: bool,
        role: &mut Option<Role>,
    ) -> bool {
        if is_super_user {
            return true;
        }
        if command.super_user_only || command.permission == Permission::SuperUser {
            return false;
        }
        if command.permission == Permission::Member {
            return true;
        }
        let resolved = match *role {
            Some(known) => known,
            None => {
                let looked_up = sender_role(ctx, message).await;
                *role = Some(looked_up);
                looked_up
            }
        };
        is_permitted(command.permission, resolved, false)
    }
}

/// The sender's group role, from the event or a member lookup.
async fn sender_role(ctx: &EventContext, message: &MessageEvent) -> Role {
    if let Some(role) = message.sender.role.as_deref() {
        return Role::parse(role);
    }
    let Some(group_id) = message.group_id.filter(|_| message.is_group()) else {
        return Role::Member;
    };
    let resp = ctx.bot.get_group_member_info(group_id, message.user_id).await;
    match resp.data.get("role").and_then(Value::as_str) {
        Some(role) if resp.is_success() => Role::parse(role),
        _ => {
            tracing::debug!(group_id, user_id = message.user_id, status = ?resp.status, "role lookup failed");
            Role::Member
        }
    }
}
