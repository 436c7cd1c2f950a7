//! Static command descriptors and their builder.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::CommandError;
use crate::gateway::dispatcher::Propagation;
use crate::models::{MessageEvent, SourceType};
use crate::permissions::Permission;

use super::router::CommandContext;
use super::waiter::RegexOptions;

/// Which conversations a command listens to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceScope {
    Private,
    Group,
    #[default]
    Both,
}

impl SourceScope {
    pub fn admits(self, source: SourceType) -> bool {
        match self {
            Self::Both => true,
            Self::Private => source == SourceType::Private,
            Self::Group => source == SourceType::Group,
        }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext) -> Propagation;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(CommandContext) -> Fut + Send + Sync,
    Fut: Future<Output = Propagation> + Send + 'static,
{
    async fn handle(&self, ctx: CommandContext) -> Propagation {
        (self)(ctx).await
    }
}

struct CommandPattern {
    source: String,
    regex: Regex,
}

/// The part of a message a pattern matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// The pattern source that matched.
    pub expression: String,
    /// Index 0 is the whole match; unmatched optional groups are `None`.
    pub captures: Vec<Option<String>>,
}

pub struct CommandDescriptor {
    pub name: String,
    patterns: Vec<CommandPattern>,
    pub permission: Permission,
    pub scope: SourceScope,
    /// Empty means every group.
    pub allowed_groups: HashSet<i64>,
    /// Empty means every user.
    pub allowed_users: HashSet<i64>,
    pub super_user_only: bool,
    /// Higher runs first.
    pub priority: i32,
    pub(crate) handler: Arc<dyn CommandHandler>,
}

impl CommandDescriptor {
    pub fn builder(name: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            name: name.into(),
            patterns: Vec::new(),
            options: RegexOptions::default(),
            permission: Permission::Member,
            scope: SourceScope::Both,
            allowed_groups: HashSet::new(),
            allowed_users: HashSet::new(),
            super_user_only: false,
            priority: 0,
            handler: None,
        }
    }

    /// Scope and allow-list check. Permission is checked separately.
    pub fn admits(&self, event: &MessageEvent) -> bool {
        if !self.scope.admits(event.message_type) {
            return false;
        }
        if !self.allowed_users.is_empty() && !self.allowed_users.contains(&event.user_id) {
            return false;
        }
        match event.group_id.filter(|_| event.is_group()) {
            Some(group_id) => self.allowed_groups.is_empty() || self.allowed_groups.contains(&group_id),
            None => true,
        }
    }

    /// First pattern that matches `text`, in declaration order.
    pub fn match_text(&self, text: &str) -> Option<PatternMatch> {
        self.patterns.iter().find_map(|pattern| {
            let caps = pattern.regex.captures(text)?;
            Some(PatternMatch {
                expression: pattern.source.clone(),
                captures: caps.iter().map(|m| m.map(|m| m.as_str().to_string())).collect(),
            })
        })
    }

    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.source.as_str())
    }
}

pub struct CommandBuilder {
    name: String,
    patterns: Vec<String>,
    options: RegexOptions,
    permission: Permission,
    scope: SourceScope,
    allowed_groups: HashSet<i64>,
    allowed_users: HashSet<i64>,
    super_user_only: bool,
    priority: i32,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl CommandBuilder {
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn options(mut self, options: RegexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    pub fn scope(mut self, scope: SourceScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn allow_group(mut self, group_id: i64) -> Self {
        self.allowed_groups.insert(group_id);
        self
    }

    pub fn allow_user(mut self, user_id: i64) -> Self {
        self.allowed_users.insert(user_id);
        self
    }

    pub fn super_user_only(mut self) -> Self {
        self.super_user_only = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn handler(mut self, handler: impl CommandHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<CommandDescriptor, CommandError> {
        if self.patterns.is_empty() {
            return Err(CommandError::NoPatterns(self.name));
        }
        let Some(handler) = self.handler else {
            return Err(CommandError::NoHandler(self.name));
        };
        let mut patterns = Vec::with_capacity(self.patterns.len());
        for source in self.patterns {
            match self.options.compile(&source) {
                Ok(regex) => patterns.push(CommandPattern { source, regex }),
                Err(e) => {
                    return Err(CommandError::Pattern {
                        name: self.name,
                        pattern: source,
                        source: e,
                    })
                }
            }
        }
        Ok(CommandDescriptor {
            name: self.name,
            patterns,
            permission: self.permission,
            scope: self.scope,
            allowed_groups: self.allowed_groups,
            allowed_users: self.allowed_users,
            super_user_only: self.super_user_only,
            priority: self.priority,
            handler,
        })
    }
}
