use anyhow::Result;
use pms_sdk::{ExtensionConfig, Plugin, PluginContext};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct HelloData {
    message: String,
}

fn main() -> Result<()> {
    let plugin = Plugin::new("plugin.a")
        .extension::<String, HelloData, _>(
            ExtensionConfig::new("hello-plugin.hello", "hello"),
            |ctx: &PluginContext, name: String| {
                let mut random = 0i64;
                for result in ctx.execute_extension::<&str, i64>("app.getRandomNumber", "") {
                    random ^= result?;
                }
                Ok(HelloData {
                    message: format!(
                        "Hello {name} from {}! Shared random: {random}",
                        ctx.plugin_id()
                    ),
                })
            },
        )
        .extension::<String, HelloData, _>(
            ExtensionConfig::new("hello-plugin.welcome", "hello")
                .with_after(["hello-plugin.hello"]),
            |_ctx, name: String| {
                Ok(HelloData {
                    message: format!("Welcome to ordered plugins world, {name}!"),
                })
            },
        )
        .extension::<String, i64, _>(
            ExtensionConfig::new("hello-plugin.getRandomNumber", "app.getRandomNumber"),
            |_ctx, _: String| Ok(4),
        );

    plugin.run()?;
    Ok(())
}
