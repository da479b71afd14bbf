//! Reference data for the submission form, loaded from CSV files in a refs directory.

use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use serde::Deserialize;
use svcboard_core::FormConfiguration;
use tracing::{info, warn};

/// `OCUPACAO,SERVICO` pairs: activity type and one allowed specification per row.
pub const SERVICES_FILE: &str = "ServicosConsolidados.csv";
/// Single `orgao` column of requesting agencies.
pub const AGENCIES_FILE: &str = "lista_orgaos.csv";

#[derive(Debug, Deserialize)]
struct ServiceRow {
    #[serde(rename = "OCUPACAO", default)]
    activity_type: Option<String>,
    #[serde(rename = "SERVICO", default)]
    specification: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgencyRow {
    #[serde(default)]
    orgao: Option<String>,
}

/// Build the form configuration from `refs_dir`. Missing files leave the matching lists
/// empty; files that exist but do not parse are errors.
pub fn load_form_configuration(refs_dir: &Path, today: NaiveDate) -> anyhow::Result<FormConfiguration> {
    let mut config = FormConfiguration::new(today);

    let services_path = refs_dir.join(SERVICES_FILE);
    if services_path.exists() {
        let mut reader = csv::Reader::from_path(&services_path)
            .with_context(|| format!("opening {}", services_path.display()))?;
        for row in reader.deserialize::<ServiceRow>() {
            let row = row.with_context(|| format!("parsing {}", services_path.display()))?;
            let activity_type = row.activity_type.unwrap_or_default().trim().to_string();
            if activity_type.is_empty() {
                continue;
            }
            if !config.activity_types.contains(&activity_type) {
                config.activity_types.push(activity_type.clone());
            }
            let specification = row.specification.unwrap_or_default().trim().to_string();
            if specification.is_empty() {
                continue;
            }
            let allowed = config.specifications.entry(activity_type).or_default();
            if !allowed.contains(&specification) {
                allowed.push(specification);
            }
        }
    } else {
        warn!(path = %services_path.display(), "activity reference file missing; no activity types offered");
    }

    let agencies_path = refs_dir.join(AGENCIES_FILE);
    if agencies_path.exists() {
        let mut reader = csv::Reader::from_path(&agencies_path)
            .with_context(|| format!("opening {}", agencies_path.display()))?;
        for row in reader.deserialize::<AgencyRow>() {
            let row = row.with_context(|| format!("parsing {}", agencies_path.display()))?;
            let agency = row.orgao.unwrap_or_default().trim().to_string();
            if !agency.is_empty() && !config.agencies.contains(&agency) {
                config.agencies.push(agency);
            }
        }
        config.agencies.sort();
    } else {
        warn!(path = %agencies_path.display(), "agency reference file missing; any agency accepted");
    }

    info!(
        activity_types = config.activity_types.len(),
        specifications = config.specifications.values().map(Vec::len).sum::<usize>(),
        agencies = config.agencies.len(),
        "form reference data loaded"
    );
    Ok(config)
}
