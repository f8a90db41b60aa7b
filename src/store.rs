use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

const MASTER_FILE: &str = "all.csv";
/// Written at the start of every new CSV so spreadsheet software picks up UTF-8.
const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// One extracted job listing. Column names match the historical dataset so old
/// and new run tables stay merge-compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "职位名称")]
    pub title: String,
    #[serde(rename = "薪资")]
    pub salary: String,
    #[serde(rename = "公司")]
    pub company: String,
    #[serde(rename = "base地点")]
    pub location: String,
    #[serde(rename = "工作经验")]
    pub experience: String,
    #[serde(rename = "学历")]
    pub education: String,
    #[serde(rename = "福利待遇")]
    pub benefits: String,
    #[serde(rename = "领域tag")]
    pub domain_tags: String,
    #[serde(rename = "职位描述内容")]
    pub description: String,
    #[serde(rename = "JD链接")]
    pub display_link: String,
    /// Canonical listing URL (query string stripped); the dedup key.
    #[serde(rename = "bossURL")]
    pub source_url: String,
    #[serde(rename = "获取时间")]
    pub captured_at: String,
}

pub struct MergeReport {
    pub total_before: usize,
    pub total_after: usize,
    pub net_new: usize,
}

/// File-backed store for one run: an append-as-you-go CSV, its JSON twin, and
/// the master table the run is merged into.
pub struct RunStore {
    csv_path: PathBuf,
    json_path: PathBuf,
    master_path: PathBuf,
}

impl RunStore {
    /// Create a store for a fresh run, named with the run timestamp.
    pub fn create(data_dir: &Path) -> Result<Self> {
        let filename = format!("boss_jobs_{}.csv", Local::now().format("%Y%m%d_%H%M%S"));
        Self::open(data_dir, &filename)
    }

    /// Open a store over an existing run table (merge/convert subcommands).
    pub fn open(data_dir: &Path, run_file: &str) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;
        let csv_path = data_dir.join(run_file);
        let json_path = csv_path.with_extension("json");
        Ok(RunStore {
            csv_path,
            json_path,
            master_path: data_dir.join(MASTER_FILE),
        })
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    /// Append one record to the run table. The header (and BOM) are written
    /// only when the file is first created.
    pub fn append(&self, record: &JobRecord) -> Result<()> {
        let new_file = !self.csv_path.exists();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Failed to open {}", self.csv_path.display()))?;
        if new_file {
            file.write_all(UTF8_BOM)?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(new_file)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        info!(title = %record.title, "appended record to run table");
        Ok(())
    }

    /// Re-serialize the run table as a JSON record array.
    pub fn convert_to_json(&self) -> Result<Option<PathBuf>> {
        if !self.csv_path.exists() {
            println!("Run table {} does not exist, nothing to convert.", self.csv_path.display());
            return Ok(None);
        }
        let records = read_table(&self.csv_path)?;
        let json = serde_json::to_string_pretty(&records)?;
        fs::write(&self.json_path, json)
            .with_context(|| format!("Failed to write {}", self.json_path.display()))?;
        info!(path = %self.json_path.display(), records = records.len(), "wrote JSON table");
        Ok(Some(self.json_path.clone()))
    }

    /// Merge this run's table into the master table, deduplicating by source
    /// URL with the newest occurrence winning.
    pub fn merge_into_master(&self) -> Result<Option<MergeReport>> {
        if !self.csv_path.exists() {
            println!("Run table {} does not exist, master unchanged.", self.csv_path.display());
            return Ok(None);
        }
        let run = read_table(&self.csv_path)?;
        if run.is_empty() {
            println!("Run table is empty, master unchanged.");
            return Ok(None);
        }

        let master = if self.master_path.exists() {
            read_table(&self.master_path)?
        } else {
            info!(path = %self.master_path.display(), "master table absent, creating");
            Vec::new()
        };

        let total_before = master.len() + run.len();
        let master_len = master.len();
        let merged = merge_records(master, run);
        write_table_atomic(&self.master_path, &merged)?;

        let report = MergeReport {
            total_before,
            total_after: merged.len(),
            net_new: merged.len() - master_len,
        };
        info!(
            before = report.total_before,
            after = report.total_after,
            net_new = report.net_new,
            "master table updated"
        );
        Ok(Some(report))
    }
}

/// Concatenate master-then-run and deduplicate by source URL. The last
/// occurrence wins (a re-seen listing carries the freshest fields) but keeps
/// the position of its first appearance.
pub fn merge_records(master: Vec<JobRecord>, run: Vec<JobRecord>) -> Vec<JobRecord> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<JobRecord> = Vec::new();
    for record in master.into_iter().chain(run) {
        match seen.get(&record.source_url) {
            Some(&slot) => out[slot] = record,
            None => {
                seen.insert(record.source_url.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Read a CSV table back into records, tolerating the leading BOM.
pub fn read_table(path: &Path) -> Result<Vec<JobRecord>> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes[..]);
    let mut reader = csv::Reader::from_reader(bytes);
    let records = reader
        .deserialize()
        .collect::<Result<Vec<JobRecord>, _>>()
        .with_context(|| format!("Malformed row in {}", path.display()))?;
    Ok(records)
}

/// Whole-file rewrite via a temp file + rename so a crash mid-write never
/// truncates the master table.
fn write_table_atomic(path: &Path, records: &[JobRecord]) -> Result<()> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(UTF8_BOM)?;
        let mut writer = csv::Writer::from_writer(file);
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Data-dir listing for the `files` command: (file name, row count).
pub fn list_tables(data_dir: &Path) -> Result<Vec<(String, usize)>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(data_dir)?
        .filter_map(|entry| {
            let name = entry.ok()?.file_name().into_string().ok()?;
            (name.ends_with(".csv") || name.ends_with(".json")).then_some(name)
        })
        .collect();
    names.sort();
    names.reverse(); // newest first, timestamped names sort lexicographically

    let mut out = Vec::new();
    for name in names {
        let rows = if name.ends_with(".csv") {
            read_table(&data_dir.join(&name)).map(|r| r.len()).unwrap_or(0)
        } else {
            0
        };
        out.push((name, rows));
    }
    Ok(out)
}

/// Newest run table in the data dir, skipping the master file.
pub fn latest_run_file(data_dir: &Path) -> Result<Option<String>> {
    let tables = list_tables(data_dir)?;
    Ok(tables
        .into_iter()
        .map(|(name, _)| name)
        .find(|name| name.ends_with(".csv") && name != MASTER_FILE))
}

// ── Tests ──
