//! `docmigrate run`

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use colored::*;
use log::info;

use crate::api::{Backends, HttpBackend, MemoryBackend};
use crate::cli::RunArgs;
use crate::config::{ImportConfig, process_env};
use crate::import::{MigrationPlan, MigrationRun, RunReport};

pub async fn handle_run_command(args: RunArgs) -> Result<()> {
    let config = ImportConfig::load(&args.config)?;
    let resilience = config.resilience()?;
    let plan = config.plan(args.data_dir.as_deref());

    let backends = if args.dry_run {
        println!("{}", "Dry run: writing to an in-memory backend".yellow());
        Backends::from_shared(Arc::new(dry_run_backend(&plan)))
    } else {
        let backend_config = config.backend_config(process_env())?;
        info!("Importing into {} (database {})", backend_config.endpoint, backend_config.database_id);
        let backend = HttpBackend::new(backend_config, resilience.monitoring.clone())
            .context("Failed to create backend client")?;
        Backends::from_shared(Arc::new(backend))
    };

    let started = Instant::now();
    let mut run = MigrationRun::new(backends, resilience, config.batch_settings());
    let report = run.run(&plan).await?;

    print_summary(&report);
    println!("Finished in {:.1}s", started.elapsed().as_secs_f64());

    if report.has_failures() {
        bail!("Run {} finished with failures", report.run_id);
    }
    Ok(())
}

/// In-memory backend holding every collection the plan touches
fn dry_run_backend(plan: &MigrationPlan) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for descriptor in &plan.collections {
        backend.add_collection(descriptor.id.as_deref().unwrap_or(&descriptor.name));
    }
    for definition in &plan.imports {
        let described = plan.collections.iter().any(|c| c.name == definition.collection);
        if !described {
            backend.add_collection(&definition.collection);
        }
    }
    backend
}

pub fn print_summary(report: &RunReport) {
    println!();
    println!("{} {}", "Run".bold(), report.run_id.dimmed());

    for definition in &report.definitions {
        let marker = if definition.is_clean() {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("{} {}", marker, definition.label.bold());

        if let Some(error) = &definition.error {
            println!("    {}", error.red());
            continue;
        }
        println!(
            "    loaded {}  created {}  existing {}  failed {}",
            definition.loaded.to_string().cyan(),
            definition.created.to_string().green(),
            definition.skipped_existing.to_string().yellow(),
            colored_count(definition.failed),
        );
        if definition.rejected > 0 {
            println!(
                "    rejected {} ({} duplicate keys, {} invalid)",
                definition.rejected.to_string().yellow(),
                definition.duplicates,
                definition.invalid
            );
        }
        if definition.merged > 0 {
            println!("    merged identities {}", definition.merged.to_string().cyan());
        }
        if definition.uploads.uploaded + definition.uploads.failed > 0 {
            println!(
                "    files uploaded {}  failed {}",
                definition.uploads.uploaded.to_string().green(),
                colored_count(definition.uploads.failed)
            );
        }
    }

    println!(
        "{} {} attributes applied, {} abandoned",
        "Schema".bold(),
        report.attributes_applied.len(),
        colored_count(report.abandoned.len())
    );
    for op in &report.abandoned {
        println!(
            "    {} {}",
            op.label().red(),
            op.error.as_deref().unwrap_or_default().dimmed()
        );
    }
    println!(
        "{} {} scanned, {} updated, {} failed, {} unresolved",
        "References".bold(),
        report.reconcile.scanned,
        report.reconcile.updated.to_string().green(),
        colored_count(report.reconcile.failed),
        report.reconcile.unresolved
    );
    if report.remap.ambiguous_merges > 0 {
        println!(
            "{} {} ambiguous identity matches resolved by email",
            "Warning".yellow().bold(),
            report.remap.ambiguous_merges
        );
    }
}

fn colored_count(count: usize) -> ColoredString {
    if count == 0 {
        count.to_string().normal()
    } else {
        count.to_string().red()
    }
}
