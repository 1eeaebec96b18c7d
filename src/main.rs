use anyhow::{bail, Context};
use relation_engine::config::{AppConfig, StoreBackend};
use relation_engine::{Catalog, PostgresDocumentStore, RelationEngine};
use std::sync::Arc;

const USAGE: &str = "usage: relation-engine migrate | resolve <entityType> <id>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(config.log_level())
        .filter_module("sqlx", LevelFilter::Warn) // Suppress sqlx Debug logs
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command: Vec<&str> = args.iter().map(String::as_str).collect();

    if config.store.backend == StoreBackend::Memory {
        bail!("the memory backend holds no data between runs; configure store.backend = \"postgres\"");
    }

    let database_url = config.database_url()?;
    let store = PostgresDocumentStore::new(&database_url, config.max_connections()).await?;

    match command.as_slice() {
        ["migrate"] => {
            store.migrate().await?;
        }
        ["resolve", entity_type, id] => {
            let catalog = load_catalog(&config)?;
            let table = catalog.require(entity_type)?;
            let engine = RelationEngine::with_settings(Arc::new(store), config.engine_settings());

            let details = engine.details(table);
            details.load(id).await?;
            details.settled().await;

            let view = details.view();
            let errors: serde_json::Map<String, serde_json::Value> = view
                .errors_by_relation
                .iter()
                .map(|(name, err)| (name.clone(), serde_json::Value::String(err.to_string())))
                .collect();
            let output = serde_json::json!({
                "entity": view.entity,
                "related": view.related_data,
                "errors": errors,
                "issues": view.issues.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => bail!(USAGE),
    }

    Ok(())
}

fn load_catalog(config: &AppConfig) -> anyhow::Result<Catalog> {
    match &config.engine.catalog_path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading relation catalog {}", path))?;
            Catalog::from_json(&json).with_context(|| format!("parsing relation catalog {}", path))
        }
        None => Ok(Catalog::builtin()?),
    }
}
