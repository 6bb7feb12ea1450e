use std::sync::Arc;

use anyhow::Context;
use catalog_repo::{CatalogConfig, Entity, Federation, Filters, RebuildReport};
use catalog_store::InMemoryKvStore;
use colored::Colorize;
use serde_json::Value;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = CatalogConfig::load(&cli.config)
        .with_context(|| format!("loading configuration {}", cli.config.display()))?;
    let store = Arc::new(
        InMemoryKvStore::load(&cli.data)
            .await
            .with_context(|| format!("loading snapshot {}", cli.data.display()))?,
    );
    let federation = Federation::new(store.clone(), config)?;
    let mutates = cli.command.mutates();
    let format = cli.format;

    match cli.command {
        Command::Get(args) => cmd_get(&federation, args, format).await?,
        Command::Create(args) => cmd_create(&federation, args, format).await?,
        Command::Update(args) => cmd_update(&federation, args).await?,
        Command::Delete(args) => cmd_delete(&federation, args).await?,
        Command::Order(args) => cmd_order(&federation, args, format).await?,
        Command::Search(args) => cmd_search(&federation, args, format).await?,
        Command::Rebuild(args) => cmd_rebuild(&federation, args, format).await?,
    }

    if mutates {
        store
            .save(&cli.data)
            .await
            .with_context(|| format!("saving snapshot {}", cli.data.display()))?;
        tracing::debug!(path = %cli.data.display(), keys = store.len(), "snapshot saved");
    }
    Ok(())
}

async fn cmd_get(federation: &Federation, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let entities = if args.ids.is_empty() {
        federation.get().await?
    } else {
        federation.get_by_ids(&args.ids).await?
    };
    print_entities(&entities, federation, format)
}

async fn cmd_create(federation: &Federation, args: CreateArgs, format: OutputFormat) -> anyhow::Result<()> {
    let entities = parse_entities(&args.json)?;
    let created = federation.create_many(entities, &args.namespace).await?;
    if format == OutputFormat::Text {
        println!(
            "{} Created {} in {}",
            "✓".green().bold(),
            plural(created.len(), "entity", "entities"),
            args.namespace.bold()
        );
    }
    print_entities(&created, federation, format)
}

async fn cmd_update(federation: &Federation, args: UpdateArgs) -> anyhow::Result<()> {
    let entities = parse_entities(&args.json)?;
    let updated = federation.update_many(entities).await?;
    println!("{} Updated {}", "✓".green().bold(), plural(updated, "entity", "entities"));
    Ok(())
}

async fn cmd_delete(federation: &Federation, args: DeleteArgs) -> anyhow::Result<()> {
    let targets = args.ids.into_iter().map(Into::into).collect();
    let deleted = federation.delete_many(targets).await?;
    println!("{} Deleted {}", "✓".green().bold(), plural(deleted, "entity", "entities"));
    Ok(())
}

async fn cmd_order(federation: &Federation, args: OrderArgs, format: OutputFormat) -> anyhow::Result<()> {
    let requested = (!args.ids.is_empty()).then_some(args.ids.as_slice());
    let order = federation.order(requested, &args.namespace).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&order)?),
        OutputFormat::Text => {
            for (position, id) in order.iter().enumerate() {
                println!("{:>4}  {}", position + 1, id.yellow());
            }
        }
    }
    Ok(())
}

async fn cmd_search(federation: &Federation, args: SearchArgs, format: OutputFormat) -> anyhow::Result<()> {
    let filters = parse_filters(&args.filters)?;
    let hits = federation.search(&filters).await?;
    if format == OutputFormat::Text && hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    print_entities(&hits, federation, format)
}

async fn cmd_rebuild(federation: &Federation, args: RebuildArgs, format: OutputFormat) -> anyhow::Result<()> {
    let reports: Vec<(String, RebuildReport)> = match args.namespace {
        Some(namespace) => {
            let report = federation.collection(&namespace)?.rebuild_indexes(None).await?;
            vec![(namespace, report)]
        }
        None => federation.rebuild_indexes().await?,
    };
    match format {
        OutputFormat::Json => {
            let summary: serde_json::Map<String, Value> = reports
                .iter()
                .map(|(namespace, r)| {
                    (
                        namespace.clone(),
                        serde_json::json!({
                            "entities": r.entities,
                            "derived_keys_removed": r.derived_keys_removed,
                            "index_entries_written": r.index_entries_written,
                            "registry_entries_removed": r.registry_entries_removed,
                        }),
                    )
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text => {
            for (namespace, r) in &reports {
                println!(
                    "{} {}  {}, {} removed, {} written, {} unregistered",
                    "✓".green().bold(),
                    namespace.bold(),
                    plural(r.entities, "entity", "entities"),
                    r.derived_keys_removed,
                    plural(r.index_entries_written, "index entry", "index entries"),
                    r.registry_entries_removed,
                );
            }
        }
    }
    Ok(())
}

fn print_entities(entities: &[Entity], federation: &Federation, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entities)?),
        OutputFormat::Text => {
            let id_properties: Vec<&str> = federation
                .collections()
                .iter()
                .map(|c| c.id_property())
                .collect();
            for entity in entities {
                let id = id_properties
                    .iter()
                    .find_map(|p| entity.get(*p).and_then(Value::as_str))
                    .unwrap_or("?");
                println!("{}  {}", id.yellow(), Value::Object(entity.clone()));
            }
        }
    }
    Ok(())
}

/// Parse a JSON object, or an array of objects, into entities.
fn parse_entities(source: &str) -> anyhow::Result<Vec<Entity>> {
    let value: Value = serde_json::from_str(source).context("entity JSON is malformed")?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(entity) => Ok(entity),
            other => anyhow::bail!("expected a JSON object, found {other}"),
        })
        .collect()
}

/// Parse `property=query` arguments.
fn parse_filters(args: &[String]) -> anyhow::Result<Filters> {
    args.iter()
        .map(|arg| {
            let (property, query) = arg
                .split_once('=')
                .with_context(|| format!("filter {arg:?} is not property=query"))?;
            Ok::<_, anyhow::Error>((property.trim().to_string(), query.to_string()))
        })
        .collect()
}

fn plural(n: usize, one: &str, many: &str) -> String {
    format!("{n} {}", if n == 1 { one } else { many })
}
