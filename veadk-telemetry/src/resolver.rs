//! Resolution of the contextual identifiers stamped on every span.
//!
//! Each field is looked up in order: the call-scoped context, the process-wide
//! configuration, an environment variable, and finally a fixed
//! `<unknown_...>` sentinel. Resolution never fails and never returns an
//! empty string.

use std::sync::Arc;
use veadk_core::ReadonlyContext;

use crate::config::ObservabilityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextField {
    SessionId,
    UserId,
    AppName,
    AgentName,
    InvocationId,
    ModelProvider,
    CallType,
}

impl ContextField {
    pub fn env_var(self) -> &'static str {
        match self {
            ContextField::SessionId => "VEADK_SESSION_ID",
            ContextField::UserId => "VEADK_USER_ID",
            ContextField::AppName => "VEADK_APP_NAME",
            ContextField::AgentName => "VEADK_AGENT_NAME",
            ContextField::InvocationId => "VEADK_INVOCATION_ID",
            ContextField::ModelProvider => "MODEL_AGENT_PROVIDER",
            ContextField::CallType => "VEADK_CALL_TYPE",
        }
    }

    pub fn fallback(self) -> &'static str {
        match self {
            ContextField::SessionId => "<unknown_session_id>",
            ContextField::UserId => "<unknown_user_id>",
            ContextField::AppName => "<unknown_app_name>",
            ContextField::AgentName => "<unknown_agent_name>",
            ContextField::InvocationId => "<unknown_invocation_id>",
            ContextField::ModelProvider => "<unknown_model_provider>",
            ContextField::CallType => "<unknown_call_type>",
        }
    }

    fn from_context<C: ReadonlyContext + ?Sized>(self, ctx: &C) -> Option<&str> {
        match self {
            ContextField::SessionId => Some(ctx.session_id()),
            ContextField::UserId => Some(ctx.user_id()),
            ContextField::AppName => Some(ctx.app_name()),
            ContextField::AgentName => Some(ctx.agent_name()),
            ContextField::InvocationId => Some(ctx.invocation_id()),
            ContextField::ModelProvider | ContextField::CallType => None,
        }
    }
}

type EnvSource = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct ContextResolver {
    app_name: String,
    model_provider: String,
    call_type: String,
    env: EnvSource,
}

impl ContextResolver {
    pub fn new(config: &ObservabilityConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            model_provider: config.model_provider.clone(),
            call_type: config.call_type.clone(),
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replaces the process environment as the third lookup tier.
    pub fn with_env(
        mut self,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn resolve<C: ReadonlyContext + ?Sized>(
        &self,
        field: ContextField,
        ctx: Option<&C>,
    ) -> String {
        if let Some(value) = ctx.and_then(|ctx| field.from_context(ctx)).filter(|v| !v.is_empty()) {
            return value.to_string();
        }

        let configured = match field {
            ContextField::AppName => self.app_name.as_str(),
            ContextField::ModelProvider => self.model_provider.as_str(),
            ContextField::CallType => self.call_type.as_str(),
            _ => "",
        };
        if !configured.is_empty() {
            return configured.to_string();
        }

        (self.env)(field.env_var())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| field.fallback().to_string())
    }

    /// Resolves without any call-scoped context.
    pub fn resolve_global(&self, field: ContextField) -> String {
        self.resolve::<dyn ReadonlyContext>(field, None)
    }
}

impl Default for ContextResolver {
    fn default() -> Self {
        Self::new(&ObservabilityConfig::default())
    }
}

impl std::fmt::Debug for ContextResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextResolver")
            .field("app_name", &self.app_name)
            .field("model_provider", &self.model_provider)
            .field("call_type", &self.call_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use veadk_core::Content;

    struct Ctx {
        user: &'static str,
        content: Content,
    }

    impl ReadonlyContext for Ctx {
        fn invocation_id(&self) -> &str {
            "inv-7"
        }
        fn agent_name(&self) -> &str {
            "planner"
        }
        fn user_id(&self) -> &str {
            self.user
        }
        fn app_name(&self) -> &str {
            ""
        }
        fn session_id(&self) -> &str {
            "s-1"
        }
        fn branch(&self) -> &str {
            ""
        }
        fn user_content(&self) -> &Content {
            &self.content
        }
    }

    fn env_of(
        pairs: &[(&'static str, &'static str)],
    ) -> impl Fn(&str) -> Option<String> + Send + Sync {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_user_id_falls_back_to_sentinel() {
        let resolver = ContextResolver::default().with_env(env_of(&[]));
        assert_eq!(resolver.resolve_global(ContextField::UserId), "<unknown_user_id>");
    }

    #[test]
    fn test_user_id_from_env() {
        let resolver = ContextResolver::default().with_env(env_of(&[("VEADK_USER_ID", "alice")]));
        assert_eq!(resolver.resolve_global(ContextField::UserId), "alice");
    }

    #[test]
    fn test_context_wins_over_env() {
        let resolver = ContextResolver::default().with_env(env_of(&[("VEADK_USER_ID", "alice")]));
        let ctx = Ctx { user: "bob", content: Content::new("user") };
        assert_eq!(resolver.resolve(ContextField::UserId, Some(&ctx)), "bob");

        let anonymous = Ctx { user: "", content: Content::new("user") };
        assert_eq!(resolver.resolve(ContextField::UserId, Some(&anonymous)), "alice");
    }

    #[test]
    fn test_config_tier() {
        let config = ObservabilityConfig {
            app_name: "travel".into(),
            model_provider: "ark".into(),
            ..Default::default()
        };
        let resolver = ContextResolver::new(&config)
            .with_env(env_of(&[("VEADK_APP_NAME", "env-app"), ("MODEL_AGENT_PROVIDER", "openai")]));
        let ctx = Ctx { user: "bob", content: Content::new("user") };

        // The context carries an empty app name, so configuration applies.
        assert_eq!(resolver.resolve(ContextField::AppName, Some(&ctx)), "travel");
        assert_eq!(resolver.resolve(ContextField::ModelProvider, Some(&ctx)), "ark");
        assert_eq!(resolver.resolve(ContextField::CallType, Some(&ctx)), "<unknown_call_type>");
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let resolver = ContextResolver::default().with_env(env_of(&[]));
        let ctx = Ctx { user: "bob", content: Content::new("user") };
        let first = resolver.resolve(ContextField::SessionId, Some(&ctx));
        let second = resolver.resolve(ContextField::SessionId, Some(&ctx));
        assert_eq!(first, second);
        assert_eq!(first, "s-1");
    }
}
