use std::sync::Arc;

use async_trait::async_trait;
use extension_system::{
    Capability, Extension, ExtensionApi, ExtensionError, ExtensionHost, ExtensionLoader,
    ExtensionManifest, HookDispatcher, HookMessage, HookPoint, Tool, ToolError,
    ToolExecutionContext, ToolParams, ToolRegistry,
};
use serde_json::{json, Value};

struct Suffix(&'static str);

#[async_trait]
impl Extension for Suffix {
    async fn on_message(&self, mut message: HookMessage, _api: &ExtensionApi) -> anyhow::Result<HookMessage> {
        message.content.push_str(self.0);
        Ok(message)
    }

    async fn on_response(&self, mut message: HookMessage, _api: &ExtensionApi) -> anyhow::Result<HookMessage> {
        message.content.push_str(self.0);
        Ok(message)
    }
}

struct Broken;

#[async_trait]
impl Extension for Broken {
    async fn on_message(&self, _message: HookMessage, _api: &ExtensionApi) -> anyhow::Result<HookMessage> {
        anyhow::bail!("message hook exploded")
    }

    async fn on_response(&self, mut message: HookMessage, _api: &ExtensionApi) -> anyhow::Result<HookMessage> {
        message.content = "garbage".to_string();
        anyhow::bail!("response hook exploded")
    }
}

struct Panicky;

#[async_trait]
impl Extension for Panicky {
    async fn on_load(&self, api: &ExtensionApi) -> anyhow::Result<()> {
        if api.has_capability(Capability::Tools) {
            api.register_tool(Arc::new(Fragile))?;
        }
        Ok(())
    }

    async fn on_response(&self, _message: HookMessage, _api: &ExtensionApi) -> anyhow::Result<HookMessage> {
        panic!("formatter bug")
    }
}

struct Fragile;

#[async_trait]
impl Tool for Fragile {
    fn name(&self) -> &str {
        "fragile"
    }

    async fn execute(&self, _context: &ToolExecutionContext, _params: ToolParams) -> Result<String, ToolError> {
        panic!("tool bug")
    }
}

struct Dice;

#[async_trait]
impl Tool for Dice {
    fn name(&self) -> &str {
        "dice"
    }

    async fn execute(&self, _context: &ToolExecutionContext, params: ToolParams) -> Result<String, ToolError> {
        match params.args().first() {
            Some(&"fail") => Err(ToolError::ExecutionFailed("dice fell off the table".into())),
            Some(notation) => Ok(format!("rolled {notation}: 4")),
            None => Ok("rolled: 4".to_string()),
        }
    }
}

struct GoldTool;

#[async_trait]
impl Tool for GoldTool {
    fn name(&self) -> &str {
        "gold"
    }

    async fn execute(&self, context: &ToolExecutionContext, _params: ToolParams) -> Result<String, ToolError> {
        Ok(context.variables.get("gold").cloned().unwrap_or(Value::Null).to_string())
    }
}

struct DiceBox;

#[async_trait]
impl Extension for DiceBox {
    async fn on_load(&self, api: &ExtensionApi) -> anyhow::Result<()> {
        api.register_tool(Arc::new(Dice))?;
        api.register_tool(Arc::new(GoldTool))?;
        Ok(())
    }
}

struct SettingsReader;

#[async_trait]
impl Extension for SettingsReader {
    async fn on_settings_change(&self, settings: &Value, api: &ExtensionApi) -> anyhow::Result<()> {
        anyhow::ensure!(api.settings()? == *settings, "settings out of sync");
        Ok(())
    }
}

fn loader() -> ExtensionLoader {
    let mut loader = ExtensionLoader::new();
    loader.register("suffix-a", || Suffix(" [a]"));
    loader.register("suffix-b", || Suffix(" [b]"));
    loader.register("broken", || Broken);
    loader.register("panicky", || Panicky);
    loader.register("dice-box", || DiceBox);
    loader.register("settings-reader", || SettingsReader);
    loader
}

fn manifest(id: &str, capabilities: &[Capability]) -> ExtensionManifest {
    ExtensionManifest::new(id, id, "1.0.0", id).with_capabilities(capabilities.iter().copied())
}

async fn host_with(manifests: Vec<ExtensionManifest>) -> Arc<ExtensionHost> {
    let host = Arc::new(ExtensionHost::new(loader(), Arc::new(ToolRegistry::new())));
    for manifest in manifests {
        let id = manifest.id.clone();
        host.load(manifest, Value::Null).await.unwrap();
        host.enable(&id).await.unwrap();
    }
    host
}

const HOOKS: &[Capability] = &[Capability::Messages, Capability::Responses];

#[tokio::test]
async fn hooks_run_in_registration_order() {
    let host = host_with(vec![manifest("suffix-b", HOOKS), manifest("suffix-a", HOOKS)]).await;
    let dispatcher = HookDispatcher::new(host);

    let outcome = dispatcher.dispatch_message(HookMessage::new("hi")).await;
    assert_eq!(outcome.message.content, "hi [b] [a]");
    assert!(outcome.failures.is_empty());
}

#[tokio::test]
async fn failing_hook_forwards_the_original_message() {
    let host = host_with(vec![
        manifest("suffix-a", HOOKS),
        manifest("broken", HOOKS),
        manifest("suffix-b", HOOKS),
    ])
    .await;
    let dispatcher = HookDispatcher::new(host);

    let outcome = dispatcher.dispatch_response(HookMessage::new("story")).await;
    assert_eq!(outcome.message.content, "story [a] [b]");
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].source, "broken");
    assert_eq!(outcome.failures[0].point, HookPoint::OnResponse);
}

#[tokio::test]
async fn panicking_hook_is_isolated() {
    let host = host_with(vec![manifest("panicky", HOOKS), manifest("suffix-a", HOOKS)]).await;
    let dispatcher = HookDispatcher::new(host);

    let outcome = dispatcher.dispatch_response(HookMessage::new("hi")).await;
    assert_eq!(outcome.message.content, "hi [a]");
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].source, "panicky");
    assert_eq!(outcome.failures[0].point, HookPoint::OnResponse);
    assert!(outcome.failures[0].error.contains("formatter bug"));
}

#[tokio::test]
async fn panicking_tool_keeps_its_call_text() {
    let host = host_with(vec![manifest("panicky", &[Capability::Tools])]).await;
    let dispatcher = HookDispatcher::new(host);

    let outcome = dispatcher
        .run_tool_calls("before {{fragile}} after", &ToolExecutionContext::default())
        .await;
    assert_eq!(outcome.text, "before {{fragile}} after");
    assert!(outcome.executed.is_empty());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].point, HookPoint::ToolCall);
    assert!(outcome.failures[0].error.contains("tool bug"));
}

#[tokio::test]
async fn failing_response_hook_matches_running_without_it() {
    let context = ToolExecutionContext::default();

    let with_broken = HookDispatcher::new(
        host_with(vec![manifest("broken", HOOKS), manifest("suffix-a", HOOKS)]).await,
    );
    let without = HookDispatcher::new(host_with(vec![manifest("suffix-a", HOOKS)]).await);

    let a = with_broken.process_response(HookMessage::new("text"), &context).await;
    let b = without.process_response(HookMessage::new("text"), &context).await;
    assert_eq!(a.message.content, b.message.content);
}

#[tokio::test]
async fn hooks_need_capabilities_and_enablement() {
    let host = host_with(vec![manifest("suffix-a", &[Capability::Responses])]).await;
    host.load(manifest("suffix-b", HOOKS), Value::Null).await.unwrap();
    let dispatcher = HookDispatcher::new(host.clone());

    let outcome = dispatcher.dispatch_message(HookMessage::new("hi")).await;
    assert_eq!(outcome.message.content, "hi");

    host.enable("suffix-b").await.unwrap();
    host.disable("suffix-a").await.unwrap();
    let outcome = dispatcher.dispatch_response(HookMessage::new("hi")).await;
    assert_eq!(outcome.message.content, "hi [b]");
}

#[tokio::test]
async fn tool_calls_are_substituted_in_document_order() {
    let host = host_with(vec![manifest("dice-box", &[Capability::Tools])]).await;
    let dispatcher = HookDispatcher::new(host);
    let mut context = ToolExecutionContext::default();
    context.variables.insert("gold".into(), json!(10));

    let text = "You have {{gold}} coins.\n/dice 2d6\n[tool:map]north[/tool] and {{dice::fail}}";
    let outcome = dispatcher.run_tool_calls(text, &context).await;

    assert_eq!(
        outcome.text,
        "You have 10 coins.\nrolled 2d6: 4\n[tool:map]north[/tool] and {{dice::fail}}"
    );
    assert_eq!(outcome.executed, vec!["gold".to_string(), "dice".to_string()]);
    assert_eq!(outcome.skipped, vec!["map".to_string()]);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].point, HookPoint::ToolCall);
}

#[tokio::test]
async fn annotations_are_opt_in() {
    let host = host_with(vec![manifest("broken", HOOKS)]).await;
    let context = ToolExecutionContext::default();

    let plain = HookDispatcher::new(host.clone());
    assert_eq!(
        plain.process_response(HookMessage::new("ok"), &context).await.message.content,
        "ok"
    );

    let annotated = HookDispatcher::new(host).with_annotations(true);
    let content = annotated
        .process_response(HookMessage::new("ok"), &context)
        .await
        .message
        .content;
    assert!(content.starts_with("ok\n\n[extension error] broken (on_response)"));
}

#[tokio::test]
async fn earlier_failures_lead_the_outcome_and_annotation() {
    let host = host_with(vec![manifest("broken", HOOKS)]).await;
    let dispatcher = HookDispatcher::new(host.clone()).with_annotations(true);

    let message_outcome = dispatcher.dispatch_message(HookMessage::new("hi")).await;
    assert_eq!(message_outcome.failures[0].point, HookPoint::OnMessage);

    let outcome = dispatcher
        .process_response_after(
            HookMessage::new("ok"),
            &ToolExecutionContext::default(),
            message_outcome.failures,
        )
        .await;
    let points: Vec<HookPoint> = outcome.failures.iter().map(|failure| failure.point).collect();
    assert_eq!(points, vec![HookPoint::OnMessage, HookPoint::OnResponse]);
    assert!(outcome
        .message
        .content
        .starts_with("ok\n\n[extension error] broken (on_message): message hook exploded; broken (on_response)"));
}

#[tokio::test]
async fn tool_registration_requires_capability() {
    let host = ExtensionHost::new(loader(), Arc::new(ToolRegistry::new()));
    let error = host
        .load(manifest("dice-box", &[]), Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(error, ExtensionError::Hook { hook: "on_load", .. }));
    assert!(host.list().await.is_empty());
    assert!(host.tools().is_empty());
}

#[tokio::test]
async fn unload_releases_tools() {
    let host = host_with(vec![manifest("dice-box", &[Capability::Tools])]).await;
    assert_eq!(host.tools().list_tool_names(), vec!["dice".to_string(), "gold".to_string()]);

    host.unload("dice-box").await.unwrap();
    assert!(host.tools().is_empty());
    assert!(matches!(host.enable("dice-box").await, Err(ExtensionError::NotLoaded(_))));
}

#[tokio::test]
async fn load_rejects_bad_manifests_and_duplicates() {
    let host = ExtensionHost::new(loader(), Arc::new(ToolRegistry::new()));

    let bad_id = ExtensionManifest::new("Suffix_A", "x", "1.0.0", "suffix-a");
    assert!(matches!(
        host.load(bad_id, Value::Null).await,
        Err(ExtensionError::InvalidManifest(_))
    ));
    let unknown = ExtensionManifest::new("ghost", "x", "1.0.0", "ghost");
    assert!(matches!(
        host.load(unknown, Value::Null).await,
        Err(ExtensionError::UnknownEntryPoint(_))
    ));

    host.load(manifest("suffix-a", HOOKS), Value::Null).await.unwrap();
    assert!(matches!(
        host.load(manifest("suffix-a", HOOKS), Value::Null).await,
        Err(ExtensionError::AlreadyLoaded(_))
    ));
}

#[tokio::test]
async fn settings_are_capability_scoped() {
    let host = ExtensionHost::new(loader(), Arc::new(ToolRegistry::new()));
    host.load(manifest("settings-reader", &[Capability::Settings]), json!({"lang": "en"}))
        .await
        .unwrap();
    host.update_settings("settings-reader", json!({"lang": "fr"}))
        .await
        .unwrap();

    let mut loader = ExtensionLoader::new();
    loader.register("settings-reader", || SettingsReader);
    let denied = ExtensionHost::new(loader, Arc::new(ToolRegistry::new()));
    denied
        .load(manifest("settings-reader", &[]), Value::Null)
        .await
        .unwrap();
    assert!(matches!(
        denied.update_settings("settings-reader", json!({})).await,
        Err(ExtensionError::Hook { hook: "on_settings_change", .. })
    ));
}
