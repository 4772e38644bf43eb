use std::env;
use std::sync::Arc;

use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use shardguard::config::{SETTINGS_FILE, Settings};
use shardguard::handlers::{Handler, SerenityModeration, SerenityVoice};
use shardguard::{BOT_NAME, Data, Error, commands, logging};
use tracing::{info, warn};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;
    let settings = Settings::load(SETTINGS_FILE).await?;
    let (shard_id, shard_count) = (settings.shard_id, settings.shard_count);

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![commands::raidmode(), commands::cachestats()],
            pre_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_start(ctx);
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    logging::log_command_end(ctx);
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                logging::log_console("Registering commands and building shard services");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                let data = Data::build(
                    settings,
                    Arc::new(SerenityModeration::new(Arc::clone(&ctx.http))),
                    Arc::new(SerenityVoice::new(Arc::clone(&ctx.http))),
                )
                .await?;
                // The gateway handler reads the services from the type map
                ctx.data.write().await.insert::<Data>(data.clone());
                let guild_ids: Vec<u64> = ready.guilds.iter().map(|guild| guild.id.get()).collect();
                data.restore_guilds(&guild_ids).await;
                Ok(data)
            })
        })
        .build();

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .event_handler(Handler)
        .framework(framework)
        .await?;

    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down {BOT_NAME}");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting {BOT_NAME}, shard {shard_id} of {shard_count}");
    let result = if shard_count > 1 {
        client.start_shard(shard_id, shard_count).await
    } else {
        client.start().await
    };
    if let Err(err) = result {
        warn!("Client stopped with an error: {err}");
    }

    if let Some(data) = client.data.read().await.get::<Data>() {
        data.shutdown();
    }
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error building the runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
