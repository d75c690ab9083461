// 📂 Legacy Exports - CSV renditions of the payroll indexed files
//
// contrcen.csv  worksites per company   (CODIGOP, CODIGODOM, VIA, CALLE, CPOSTAL, MUNICIPIO, PROVINCIA)
// convvaca.csv  vacation balance rules  (CODIGOP, DIAS, TIPO, AD_DIAS1, AD_MOD1, ID)
//
// Column names follow the indexed-file field names. File names are matched
// case-insensitively.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const WORKER_PLACE_EXPORT: &str = "contrcen";
pub const VACATION_BALANCE_EXPORT: &str = "convvaca";

// ============================================================================
// ROW TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerPlaceRow {
    #[serde(rename = "CODIGOP", default)]
    pub company: String,

    #[serde(rename = "CODIGODOM", default)]
    pub site_code: String,

    #[serde(rename = "VIA", default)]
    pub street_type: String,

    #[serde(rename = "CALLE", default)]
    pub street: String,

    #[serde(rename = "CPOSTAL", default)]
    pub postal_code: String,

    #[serde(rename = "MUNICIPIO", default)]
    pub municipality: String,

    #[serde(rename = "PROVINCIA", default)]
    pub province: String,
}

impl WorkerPlaceRow {
    /// Company code followed by the site code
    pub fn worker_place_id(&self) -> String {
        format!("{}{}", self.company.trim(), self.site_code.trim())
    }

    /// Address parts joined by spaces, or the id when the address is empty
    pub fn description(&self) -> String {
        let parts: Vec<&str> = [
            self.street_type.as_str(),
            self.street.as_str(),
            self.postal_code.as_str(),
            self.municipality.as_str(),
            self.province.as_str(),
        ]
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

        if parts.is_empty() {
            self.worker_place_id()
        } else {
            parts.join(" ")
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VacationBalanceRow {
    #[serde(rename = "CODIGOP", default)]
    pub company: String,

    #[serde(rename = "DIAS", default)]
    pub days: String,

    #[serde(rename = "TIPO", default)]
    pub day_type: String,

    #[serde(rename = "AD_DIAS1", default)]
    pub extra_days: String,

    #[serde(rename = "AD_MOD1", default)]
    pub extra_modifier: String,

    #[serde(rename = "ID", default)]
    pub rule_id: String,
}

impl VacationBalanceRow {
    /// `{company} -> {days}{type} {extra}{modifier} ({id})`, days truncated to an integer
    pub fn identifier(&self) -> String {
        let days = self
            .days
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map(|d| d.trunc() as i64)
            .unwrap_or(0);

        format!(
            "{} -> {}{} {}{} ({})",
            self.company.trim(),
            days,
            self.day_type.trim(),
            self.extra_days.trim(),
            self.extra_modifier.trim(),
            self.rule_id.trim()
        )
    }
}

// ============================================================================
// READERS
// ============================================================================

/// Locate `{stem}.csv` in `dir`, ignoring case
pub fn find_export(dir: &Path, stem: &str) -> Result<PathBuf> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to open export directory: {:?}", dir))?;

    for entry in entries {
        let path = entry?.path();
        let stem_matches = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map_or(false, |s| s.eq_ignore_ascii_case(stem));
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
        if stem_matches && is_csv {
            return Ok(path);
        }
    }

    anyhow::bail!("Export {}.csv not found in {:?}", stem, dir)
}

fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open export: {:?}", path))?;

    let mut rows = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: T = result.with_context(|| format!("Bad row {} in {:?}", line + 2, path))?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_worker_places(dir: &Path) -> Result<Vec<WorkerPlaceRow>> {
    let path = find_export(dir, WORKER_PLACE_EXPORT)?;
    read_rows(&path)
}

pub fn read_vacation_balances(dir: &Path) -> Result<Vec<VacationBalanceRow>> {
    let path = find_export(dir, VACATION_BALANCE_EXPORT)?;
    read_rows(&path)
}
