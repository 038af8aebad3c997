//! Parquet snapshots of one period: stored records, their ranking and a
//! manifest with digests.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use mf_core::{FundamentalsRecord, PeriodFilter, RankedStock};
use mf_query::{rank_all, RankCriteria};
use mf_storage::RecordStore;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub export_id: Uuid,
    pub period: String,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub snapshot_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub records: usize,
    pub ranked: usize,
}

fn period_label(filter: &PeriodFilter) -> String {
    match filter {
        PeriodFilter::Year(year) => year.to_string(),
        PeriodFilter::Exact(period) => period.to_string(),
    }
}

pub async fn export_period_snapshot(
    store: &dyn RecordStore,
    filter: PeriodFilter,
    criteria: &RankCriteria,
    out_root: &Path,
) -> Result<ExportSummary> {
    let label = period_label(&filter);
    let records = store
        .records_for(filter)
        .await
        .with_context(|| format!("loading records for {label}"))?;
    let ranked = rank_all(&records, criteria);

    let snapshot_dir = out_root.join("snapshots").join(&label);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let records_path = snapshot_dir.join("records.parquet");
    let rankings_path = snapshot_dir.join("rankings.parquet");
    write_records_parquet(&records_path, &records)?;
    write_rankings_parquet(&rankings_path, &ranked)?;

    let manifest = ParquetManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        export_id: Uuid::new_v4(),
        period: label.clone(),
        generated_at: Utc::now(),
        files: vec![
            manifest_entry("records", out_root, &records_path, records.len())?,
            manifest_entry("rankings", out_root, &rankings_path, ranked.len())?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(period = %label, records = records.len(), ranked = ranked.len(), "snapshot exported");
    Ok(ExportSummary {
        snapshot_dir,
        manifest_path,
        records: records.len(),
        ranked: ranked.len(),
    })
}

fn record_fields() -> Vec<ArrowField> {
    vec![
        ArrowField::new("symbol", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("month", DataType::UInt32, true),
        ArrowField::new("company_name", DataType::Utf8, false),
        ArrowField::new("sector", DataType::Utf8, true),
        ArrowField::new("ebit", DataType::Float64, false),
        ArrowField::new("enterprise_value", DataType::Float64, false),
        ArrowField::new("tangible_capital", DataType::Float64, false),
        ArrowField::new("earnings_yield", DataType::Float64, false),
        ArrowField::new("return_on_capital", DataType::Float64, false),
        ArrowField::new("market_cap", DataType::Float64, false),
        ArrowField::new("current_price", DataType::Float64, true),
        ArrowField::new("data_source", DataType::Utf8, false),
        ArrowField::new("updated_at", DataType::Utf8, false),
    ]
}

fn record_columns<'a>(records: impl Iterator<Item = &'a FundamentalsRecord> + Clone) -> Vec<arrow_array::ArrayRef> {
    vec![
        Arc::new(StringArray::from(records.clone().map(|r| r.symbol.as_str()).collect::<Vec<_>>())),
        Arc::new(Int32Array::from(records.clone().map(|r| r.period.year).collect::<Vec<_>>())),
        Arc::new(UInt32Array::from(records.clone().map(|r| r.period.month).collect::<Vec<_>>())),
        Arc::new(StringArray::from(records.clone().map(|r| r.company_name.as_str()).collect::<Vec<_>>())),
        Arc::new(StringArray::from(records.clone().map(|r| r.sector.as_deref()).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.clone().map(|r| r.ebit).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.clone().map(|r| r.enterprise_value).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.clone().map(|r| r.tangible_capital).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.clone().map(|r| r.earnings_yield).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.clone().map(|r| r.return_on_capital).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.clone().map(|r| r.market_cap).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(records.clone().map(|r| r.current_price).collect::<Vec<_>>())),
        Arc::new(StringArray::from(records.clone().map(|r| r.data_source.as_str()).collect::<Vec<_>>())),
        Arc::new(StringArray::from(records.map(|r| r.updated_at.to_rfc3339()).collect::<Vec<_>>())),
    ]
}

fn write_records_parquet(path: &Path, records: &[FundamentalsRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(record_fields()));
    let batch = RecordBatch::try_new(schema, record_columns(records.iter()))
        .context("building records record batch")?;
    write_parquet(path, batch)
}

fn write_rankings_parquet(path: &Path, ranked: &[RankedStock]) -> Result<()> {
    let mut fields = vec![
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("ey_rank", DataType::UInt32, false),
        ArrowField::new("roc_rank", DataType::UInt32, false),
        ArrowField::new("magic_formula_score", DataType::UInt32, false),
    ];
    fields.extend(record_fields());
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<arrow_array::ArrayRef> = vec![
        Arc::new(UInt32Array::from(ranked.iter().map(|s| s.rank).collect::<Vec<_>>())),
        Arc::new(UInt32Array::from(ranked.iter().map(|s| s.ey_rank).collect::<Vec<_>>())),
        Arc::new(UInt32Array::from(ranked.iter().map(|s| s.roc_rank).collect::<Vec<_>>())),
        Arc::new(UInt32Array::from(ranked.iter().map(|s| s.magic_formula_score).collect::<Vec<_>>())),
    ];
    columns.extend(record_columns(ranked.iter().map(|s| &s.record)));

    let batch = RecordBatch::try_new(schema, columns).context("building rankings record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, root: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mf_core::{Period, ProviderReport, ScreeningCriteria};
    use mf_storage::MemoryRecordStore;

    fn record(symbol: &str, ebit: f64) -> FundamentalsRecord {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
        let report = ProviderReport {
            symbol: symbol.to_string(),
            year: 2023,
            company_name: format!("{symbol} Co"),
            sector: None,
            ebit,
            enterprise_value: 1_000.0,
            tangible_capital: 800.0,
            market_cap: 3e9,
            current_price: Some(42.0),
        };
        FundamentalsRecord::from_report(report, Period::annual(2023), "test", &ScreeningCriteria::default(), at)
            .unwrap()
    }

    #[tokio::test]
    async fn snapshot_writes_parquet_files_and_manifest() {
        let store = MemoryRecordStore::new();
        store.upsert_record(&record("AAA", 120.0)).await.unwrap();
        store.upsert_record(&record("BBB", 90.0)).await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let summary = export_period_snapshot(&store, PeriodFilter::Year(2023), &RankCriteria::default(), dir.path())
            .await
            .unwrap();
        assert_eq!((summary.records, summary.ranked), (2, 2));
        assert!(summary.snapshot_dir.ends_with("snapshots/2023"));

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&summary.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(manifest.period, "2023");
        let names = manifest.files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["records", "rankings"]);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).unwrap();
            assert_eq!(bytes.len() as u64, file.bytes);
            assert_eq!(hex::encode(Sha256::digest(&bytes)), file.sha256);
            assert_eq!(&bytes[..4], b"PAR1");
        }
    }

    #[tokio::test]
    async fn empty_period_still_exports_empty_files() {
        let store = MemoryRecordStore::new();
        let dir = tempfile::tempdir().unwrap();
        let summary = export_period_snapshot(
            &store,
            PeriodFilter::Exact(Period::monthly(2024, 2)),
            &RankCriteria::default(),
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(summary.records, 0);
        assert!(summary.snapshot_dir.ends_with("snapshots/2024-02"));
    }
}
