//! Job listing — `harvest jobs`.

use std::path::Path;

use anyhow::{Context, Result};
use harvest::store::HarvestDb;

pub fn cmd_jobs(db_path: &Path, json: bool) -> Result<()> {
    if !db_path.exists() {
        println!("No database at {}. Run `harvest init-db` first.", db_path.display());
        return Ok(());
    }
    let db = HarvestDb::new(db_path).context("Failed to open harvest database")?;
    let jobs = db.list_jobs()?;

    if json {
        let mut rows = Vec::with_capacity(jobs.len());
        for job in jobs {
            let statistics = db.statistics(Some(job.id))?;
            rows.push(serde_json::json!({"job": job, "statistics": statistics}));
        }
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs yet.");
        return Ok(());
    }

    println!(
        "{:>4}  {:<20} {:<20} {:>9} {:>9} {:>9}",
        "ID", "LABEL", "PHASE", "ENTITIES", "RESOLVED", "CONTACTS"
    );
    for job in jobs {
        let stats = db.statistics(Some(job.id))?;
        println!(
            "{:>4}  {:<20} {:<20} {:>9} {:>9} {:>9}",
            job.id,
            job.label,
            job.phase.as_str(),
            stats.total,
            stats.resolved + stats.resolved_empty,
            stats.total_contacts
        );
        if let Some(error) = &job.error {
            println!("      error: {}", error);
        }
    }
    Ok(())
}
