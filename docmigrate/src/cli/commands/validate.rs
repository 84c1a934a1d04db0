//! `docmigrate validate`

use anyhow::{Result, bail};
use colored::*;

use crate::cli::ValidateArgs;
use crate::config::ImportConfig;
use crate::import::converters::ConverterRegistry;
use crate::import::loader::{check_definition, check_references, load_records};
use crate::import::{ImportDefinition, MigrationPlan};

/// Check one definition and its data file; returns the record count
pub fn check_import(plan: &MigrationPlan, definition: &ImportDefinition) -> Result<usize> {
    check_definition(definition)?;
    check_references(definition, &plan.collections)?;
    let records = load_records(&plan.data_dir, definition)?;
    Ok(records.len())
}

/// Converter names that are not registered; they pass values through unchanged
pub fn unknown_converters(definition: &ImportDefinition, converters: &ConverterRegistry) -> Vec<String> {
    let mut unknown: Vec<String> = definition
        .mappings
        .iter()
        .flat_map(|m| m.converters.iter())
        .filter(|name| !converters.contains(name))
        .cloned()
        .collect();
    unknown.dedup();
    unknown
}

pub fn handle_validate_command(args: ValidateArgs) -> Result<()> {
    let config = ImportConfig::load(&args.config)?;
    config.resilience()?;
    let plan = config.plan(args.data_dir.as_deref());
    let converters = ConverterRegistry::builtin();

    println!(
        "{} {} ({} collections, {} imports)",
        "Config".bold(),
        args.config.display(),
        plan.collections.len(),
        plan.imports.len()
    );

    let mut problems = 0;
    for definition in &plan.imports {
        match check_import(&plan, definition) {
            Ok(count) => println!("{} {} ({} records)", "✓".green(), definition.label(), count),
            Err(e) => {
                problems += 1;
                println!("{} {}: {:#}", "✗".red(), definition.label(), e);
            }
        }
        for name in unknown_converters(definition, &converters) {
            println!("{}   unknown converter '{}' will pass values through", "!".yellow(), name);
        }
    }

    let described: Vec<&str> = plan.collections.iter().map(|c| c.name.as_str()).collect();
    for descriptor in &plan.collections {
        for relationship in &descriptor.relationships {
            if !described.contains(&relationship.related_collection.as_str()) {
                println!(
                    "{} {}.{} relates to undescribed collection '{}'",
                    "!".yellow(),
                    descriptor.name,
                    relationship.key,
                    relationship.related_collection
                );
            }
        }
    }

    if problems > 0 {
        bail!("{} of {} imports have problems", problems, plan.imports.len());
    }
    println!("{}", "Configuration is valid".green());
    Ok(())
}
