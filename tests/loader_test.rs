use farm_query::dataset::{ColumnKind, DatasetCache, TableParser, TabularSource};
use farm_query::error::{LoadError, LoadErrorKind};
use polars::prelude::*;
use rust_xlsxwriter::{Format, Workbook};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Slaughter records for December 2023 and January 2024.
fn write_fazendas(path: &Path) {
    let mut workbook = Workbook::new();
    let date_format = Format::new().set_num_format("yyyy-mm-dd");
    let sheet = workbook.add_worksheet();

    for (col, name) in ["DATA", "FAZENDA", "CABECAS", "PESO TOTAL", "FUNRURAL"].iter().enumerate() {
        sheet.write_string(0, col as u16, *name).unwrap();
    }

    // 2023-12-15, 2023-12-20, 2024-01-10 as Excel serials
    let rows = [
        (45275.0, "Santa Rita", 12.0, 6120.5, 410.25),
        (45280.0, "Boa Vista", 8.0, 4010.0, 268.8),
        (45301.0, "Santa Rita", 15.0, 7650.0, 512.6),
    ];
    for (idx, (serial, farm, heads, weight, funrural)) in rows.iter().enumerate() {
        let row = idx as u32 + 1;
        sheet.write_number_with_format(row, 0, *serial, &date_format).unwrap();
        sheet.write_string(row, 1, *farm).unwrap();
        sheet.write_number(row, 2, *heads).unwrap();
        sheet.write_number(row, 3, *weight).unwrap();
        sheet.write_number(row, 4, *funrural).unwrap();
    }

    workbook.save(path).unwrap();
}

#[tokio::test]
async fn test_xlsx_loads_with_inferred_types() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Fazendas.xlsx");
    write_fazendas(&path);

    let cache = DatasetCache::for_files().with_required_columns(["DATA", "CABECAS"]);
    let dataset = cache.load(path.to_str().unwrap()).await.unwrap();

    assert_eq!(dataset.height(), 3);
    assert_eq!(dataset.column("DATA").unwrap().kind, ColumnKind::Date);
    assert_eq!(dataset.column("FAZENDA").unwrap().kind, ColumnKind::String);
    assert_eq!(dataset.column("CABECAS").unwrap().kind, ColumnKind::Numeric);
    assert_eq!(dataset.frame().column("CABECAS").unwrap().dtype(), &DataType::Int64);
    assert_eq!(dataset.frame().column("PESO TOTAL").unwrap().dtype(), &DataType::Float64);

    let sample = dataset.sample_rows(1);
    assert!(sample.starts_with(
        "DATA | FAZENDA | CABECAS | PESO TOTAL | FUNRURAL\n2023-12-15 | Santa Rita | 12"
    ));
}

#[tokio::test]
async fn test_csv_file_and_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abates.csv");
    std::fs::write(&path, "MES,CABECAS\nJan,10\nFev,20\n").unwrap();

    let cache = DatasetCache::for_files();
    let dataset = cache.load(path.to_str().unwrap()).await.unwrap();
    assert_eq!(dataset.column_names(), vec!["MES", "CABECAS"]);

    let missing = dir.path().join("nao_existe.xlsx");
    let err = cache.load(missing.to_str().unwrap()).await.unwrap_err();
    assert_eq!(err.kind, LoadErrorKind::Unreadable);
}

#[tokio::test]
async fn test_missing_required_column_is_schema_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Fazendas.xlsx");
    write_fazendas(&path);

    let cache = DatasetCache::for_files().with_required_columns(["VALOR ARROBA"]);
    let err = cache.load(path.to_str().unwrap()).await.unwrap_err();
    assert_eq!(err.kind, LoadErrorKind::SchemaMismatch);
}

struct StaticSource;

impl TabularSource for StaticSource {
    fn read(&self, _key: &str) -> std::io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Parser that takes a while and counts how often it runs.
struct SlowParser {
    calls: AtomicUsize,
}

impl TableParser for SlowParser {
    fn parse(&self, _key: &str, _bytes: Vec<u8>) -> Result<DataFrame, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        Ok(df!["MES" => ["Jan"], "CABECAS" => [10i64]].unwrap())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_parse_once() {
    let parser = Arc::new(SlowParser {
        calls: AtomicUsize::new(0),
    });
    let cache = Arc::new(DatasetCache::new(Arc::new(StaticSource), parser.clone()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.load("Fazendas.xlsx").await })
        })
        .collect();

    let mut loaded = Vec::new();
    for handle in handles {
        loaded.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.fill_count(), 1);
    assert!(loaded.iter().all(|d| d.same_snapshot(&loaded[0])));
}

/// Fails the first read, succeeds afterwards.
struct FlakySource {
    reads: AtomicUsize,
}

impl TabularSource for FlakySource {
    fn read(&self, key: &str) -> std::io::Result<Vec<u8>> {
        if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(std::io::Error::new(std::io::ErrorKind::Other, format!("{} busy", key)))
        } else {
            Ok(b"MES,CABECAS\nJan,10\n".to_vec())
        }
    }
}

#[tokio::test]
async fn test_failed_fill_is_retried_on_next_load() {
    let cache = DatasetCache::new(
        Arc::new(FlakySource {
            reads: AtomicUsize::new(0),
        }),
        Arc::new(farm_query::dataset::CsvParser::default()),
    );

    assert_eq!(cache.load("abates.csv").await.unwrap_err().kind, LoadErrorKind::Unreadable);
    assert_eq!(cache.load("abates.csv").await.unwrap().height(), 1);
    assert_eq!(cache.fill_count(), 2);
}

/// Rewrite `path` with its modification time `ahead` of now.
fn rewrite(path: &Path, contents: &str, ahead: Duration) {
    std::fs::write(path, contents).unwrap();
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() + ahead)
        .unwrap();
}

#[tokio::test]
async fn test_revalidation_reloads_changed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abates.csv");
    let key = path.to_str().unwrap();
    std::fs::write(&path, "MES,CABECAS\nJan,10\n").unwrap();

    let cache = DatasetCache::for_files().with_revalidation(true);
    let first = cache.load(key).await.unwrap();
    assert_eq!(first.height(), 1);

    let unchanged = cache.load(key).await.unwrap();
    assert!(unchanged.same_snapshot(&first));
    assert_eq!(cache.fill_count(), 1);

    rewrite(&path, "MES,CABECAS\nJan,99\nFev,20\n", Duration::from_secs(10));
    let second = cache.load(key).await.unwrap();

    assert_eq!(cache.fill_count(), 2);
    assert_eq!(second.height(), 2);
    assert!(second.sample_rows(1).contains("Jan | 99"));
    assert_ne!(second.version(), first.version());
}

#[tokio::test]
async fn test_without_revalidation_changed_file_stays_cached() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abates.csv");
    let key = path.to_str().unwrap();
    std::fs::write(&path, "MES,CABECAS\nJan,10\n").unwrap();

    let cache = DatasetCache::for_files();
    cache.load(key).await.unwrap();
    rewrite(&path, "MES,CABECAS\nJan,99\nFev,20\n", Duration::from_secs(10));

    let cached = cache.load(key).await.unwrap();
    assert_eq!(cache.fill_count(), 1);
    assert_eq!(cached.height(), 1);
    assert!(cached.sample_rows(1).contains("Jan | 10"));
}
