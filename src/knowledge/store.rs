//! Knowledge Store - JSON 파일 기반 지식 저장소
//!
//! 지식 스니펫(텍스트 + 선택적 이미지 참조)의 단일 원본(source of truth)입니다.
//! 저장 위치: ~/.qalam-rag/knowledge.json
//!
//! - 읽기: 불변 `StoreSnapshot`(Arc)을 통째로 얻으므로 변경 전/후 상태 중
//!   하나만 관찰됩니다.
//! - 쓰기: 단일 writer 락으로 직렬화되며, 성공할 때마다 `revision`이 증가합니다.
//! - 삭제 시 남은 레코드의 id는 기존 순서대로 1..N으로 다시 매겨집니다.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.qalam-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".qalam-rag")
}

// ============================================================================
// Types
// ============================================================================

/// 지식 레코드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    /// 1부터 시작하는 id (삭제 시 재번호)
    pub id: i64,
    #[serde(default)]
    pub content: String,
    /// 이미지 URL/경로 (예전 문서의 `file_url` 키도 허용)
    #[serde(default, alias = "file_url")]
    pub media_ref: Option<String>,
}

/// 저장소의 한 시점 상태 (불변)
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// 변경마다 증가하는 liveness marker
    pub revision: u64,
    pub records: Vec<KnowledgeRecord>,
}

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// 단순 필터 검색 기준
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchBy {
    /// 내용에 대한 대소문자 무시 부분 문자열
    Text,
    /// id 정확히 일치
    Id,
}

impl FromStr for SearchBy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(SearchBy::Text),
            "id" => Ok(SearchBy::Id),
            other => anyhow::bail!("Unknown search mode '{}': expected 'text' or 'id'", other),
        }
    }
}

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub record_count: usize,
    pub media_count: usize,
    pub total_content_bytes: usize,
    pub revision: u64,
    pub data_file: PathBuf,
    pub last_modified: Option<DateTime<Utc>>,
}

/// writer 락이 보호하는 상태
#[derive(Debug)]
struct WriterState {
    /// 마지막으로 읽거나 쓴 시점의 파일 수정 시각
    disk_mtime: Option<SystemTime>,
}

// ============================================================================
// KnowledgeStore
// ============================================================================

/// Knowledge Store - 파일 기반 지식 저장소
pub struct KnowledgeStore {
    path: PathBuf,
    state: RwLock<Arc<StoreSnapshot>>,
    writer: Mutex<WriterState>,
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("KnowledgeStore")
            .field("path", &self.path)
            .field("revision", &snapshot.revision)
            .field("records", &snapshot.len())
            .finish()
    }
}

impl KnowledgeStore {
    /// 저장소 열기 (없으면 `[]`로 생성)
    ///
    /// 손상된 문서는 경고를 남기고 빈 저장소로 초기화합니다.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create data directory")?;
            }
        }

        let records = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read knowledge file {:?}", path))?;
            match parse_document(&raw) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(
                        "Knowledge file {:?} is malformed ({}), reinitializing empty store",
                        path,
                        e
                    );
                    write_atomic(path, &render_document(&[])?)?;
                    Vec::new()
                }
            }
        } else {
            write_atomic(path, &render_document(&[])?)?;
            Vec::new()
        };

        tracing::debug!("Knowledge store opened at {:?} ({} records)", path, records.len());

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(Arc::new(StoreSnapshot {
                revision: 1,
                records,
            })),
            writer: Mutex::new(WriterState {
                disk_mtime: file_mtime(path),
            }),
        })
    }

    /// 파일 경로 반환
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 현재 상태 스냅샷 (한 번 읽은 뒤에는 변하지 않음)
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        // 스냅샷은 Arc 교체로만 바뀌므로 poison 상태여도 내용은 온전함
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 현재 revision
    pub fn revision(&self) -> u64 {
        self.snapshot().revision
    }

    /// 전체 레코드 (저장 순서)
    pub fn list(&self) -> Vec<KnowledgeRecord> {
        self.snapshot().records.clone()
    }

    /// id로 레코드 조회
    pub fn get(&self, id: i64) -> Option<KnowledgeRecord> {
        self.snapshot().records.iter().find(|r| r.id == id).cloned()
    }

    /// 레코드 추가 (id = 현재 최대 id + 1)
    pub fn add(&self, content: &str, media_ref: Option<String>) -> Result<KnowledgeRecord> {
        let mut writer = self.lock_writer()?;
        let mut records = self.snapshot().records.clone();

        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let record = KnowledgeRecord {
            id: next_id,
            content: content.trim().to_string(),
            media_ref: media_ref
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
        };
        records.push(record.clone());

        self.commit(&mut writer, records)?;
        tracing::info!("Added knowledge record id={}", record.id);

        Ok(record)
    }

    /// 레코드 내용 수정
    ///
    /// 해당 id가 없으면 `false`.
    pub fn update(&self, id: i64, content: &str) -> Result<bool> {
        let mut writer = self.lock_writer()?;
        let mut records = self.snapshot().records.clone();

        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        record.content = content.trim().to_string();

        self.commit(&mut writer, records)?;
        tracing::info!("Updated knowledge record id={}", id);

        Ok(true)
    }

    /// 레코드 삭제 후 남은 레코드를 1..N으로 재번호
    ///
    /// 해당 id가 없으면 `false` (파일은 건드리지 않음).
    pub fn delete(&self, id: i64) -> Result<bool> {
        let mut writer = self.lock_writer()?;
        let mut records = self.snapshot().records.clone();

        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Ok(false);
        }
        renumber(&mut records);

        self.commit(&mut writer, records)?;
        tracing::info!("Deleted knowledge record id={} (renumbered {} records)", id, before - 1);

        Ok(true)
    }

    /// 단순 필터 검색 (시맨틱 검색 아님)
    pub fn search(&self, query: &str, by: SearchBy) -> Vec<KnowledgeRecord> {
        let snapshot = self.snapshot();
        let query = query.trim().to_lowercase();

        if query.is_empty() {
            return snapshot.records.clone();
        }

        match by {
            SearchBy::Id => match query.parse::<i64>() {
                Ok(id) => snapshot.records.iter().filter(|r| r.id == id).cloned().collect(),
                Err(_) => Vec::new(),
            },
            SearchBy::Text => snapshot
                .records
                .iter()
                .filter(|r| r.content.to_lowercase().contains(&query))
                .cloned()
                .collect(),
        }
    }

    /// 저장소 통계
    pub fn stats(&self) -> StoreStats {
        let snapshot = self.snapshot();
        StoreStats {
            record_count: snapshot.len(),
            media_count: snapshot.records.iter().filter(|r| r.media_ref.is_some()).count(),
            total_content_bytes: snapshot.records.iter().map(|r| r.content.len()).sum(),
            revision: snapshot.revision,
            data_file: self.path.clone(),
            last_modified: file_mtime(&self.path).map(DateTime::<Utc>::from),
        }
    }

    /// 외부에서 파일이 수정되었으면 다시 읽기
    ///
    /// 다시 읽었으면 `true`. 손상된 파일은 무시하고 현재 상태를 유지합니다.
    pub fn sync_from_disk(&self) -> Result<bool> {
        let mut writer = self.lock_writer()?;

        let current_mtime = file_mtime(&self.path);
        if current_mtime == writer.disk_mtime {
            return Ok(false);
        }

        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Knowledge file {:?} unreadable during resync: {}", self.path, e);
                return Ok(false);
            }
        };

        let records = match parse_document(&raw) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    "Knowledge file {:?} changed but is malformed ({}), keeping current state",
                    self.path,
                    e
                );
                writer.disk_mtime = current_mtime;
                return Ok(false);
            }
        };

        writer.disk_mtime = current_mtime;
        let count = records.len();
        self.publish(records);
        tracing::info!("Reloaded knowledge file after external edit ({} records)", count);

        Ok(true)
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, WriterState>> {
        self.writer
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 파일에 쓰고 새 스냅샷 발행 (writer 락을 잡은 상태에서만 호출)
    fn commit(&self, writer: &mut WriterState, records: Vec<KnowledgeRecord>) -> Result<()> {
        write_atomic(&self.path, &render_document(&records)?)?;
        writer.disk_mtime = file_mtime(&self.path);
        self.publish(records);
        Ok(())
    }

    fn publish(&self, records: Vec<KnowledgeRecord>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let revision = state.revision + 1;
        *state = Arc::new(StoreSnapshot { revision, records });
    }
}

// ============================================================================
// Document Format
// ============================================================================

/// JSON 문서 파싱
pub fn parse_document(raw: &str) -> Result<Vec<KnowledgeRecord>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).context("Failed to parse knowledge document")
}

/// JSON 문서 직렬화 (2칸 들여쓰기, 유니코드 그대로)
pub fn render_document(records: &[KnowledgeRecord]) -> Result<String> {
    serde_json::to_string_pretty(records).context("Failed to serialize knowledge document")
}

/// id를 저장 순서대로 1..N으로 재번호
pub fn renumber(records: &mut [KnowledgeRecord]) {
    for (index, record) in records.iter_mut().enumerate() {
        record.id = index as i64 + 1;
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// 임시 파일에 쓴 뒤 rename (부분 기록 방지)
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write temporary file {:?}", tmp))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace knowledge file {:?}", path))?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, KnowledgeStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("knowledge.json");
        let store = KnowledgeStore::open(&path).unwrap();
        (dir, store)
    }

    fn ids(store: &KnowledgeStore) -> Vec<i64> {
        store.list().iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_open_creates_empty_document() {
        let (_dir, store) = create_test_store();
        assert!(store.list().is_empty());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.trim(), "[]");
    }

    #[test]
    fn test_add_and_get() {
        let (_dir, store) = create_test_store();

        let first = store.add("الخلية وحدة الحياة", None).unwrap();
        let second = store
            .add("", Some("/static/uploads/cell.png".to_string()))
            .unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(store.get(1).unwrap().content, "الخلية وحدة الحياة");
        assert_eq!(
            store.get(2).unwrap().media_ref.as_deref(),
            Some("/static/uploads/cell.png")
        );
        assert!(store.get(3).is_none());
    }

    #[test]
    fn test_blank_media_ref_is_none() {
        let (_dir, store) = create_test_store();
        let record = store.add("نص", Some("   ".to_string())).unwrap();
        assert!(record.media_ref.is_none());
    }

    #[test]
    fn test_update() {
        let (_dir, store) = create_test_store();
        store.add("قديم", None).unwrap();

        assert!(store.update(1, "جديد").unwrap());
        assert_eq!(store.get(1).unwrap().content, "جديد");
        assert!(!store.update(42, "لا شيء").unwrap());
    }

    #[test]
    fn test_delete_renumbers_contiguously() {
        let (_dir, store) = create_test_store();
        for text in ["a", "b", "c", "d", "e"] {
            store.add(text, None).unwrap();
        }

        assert!(store.delete(2).unwrap());
        assert!(store.delete(4).unwrap());
        assert!(!store.delete(99).unwrap());

        assert_eq!(ids(&store), vec![1, 2, 3]);
        let contents: Vec<String> = store.list().into_iter().map(|r| r.content).collect();
        assert_eq!(contents, vec!["a", "c", "d"]);

        // 재번호 이후 추가는 N + 1
        let record = store.add("f", None).unwrap();
        assert_eq!(record.id, 4);
    }

    #[test]
    fn test_ids_stay_contiguous_after_mixed_operations() {
        let (_dir, store) = create_test_store();
        for round in 0..4 {
            for i in 0..3 {
                store.add(&format!("r{}-{}", round, i), None).unwrap();
            }
            store.delete(1).unwrap();
            let n = store.list().len() as i64;
            assert_eq!(ids(&store), (1..=n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_revision_bumps_only_on_change() {
        let (_dir, store) = create_test_store();
        let start = store.revision();

        store.add("x", None).unwrap();
        assert_eq!(store.revision(), start + 1);

        store.delete(99).unwrap();
        store.update(99, "y").unwrap();
        assert_eq!(store.revision(), start + 1);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let (_dir, store) = create_test_store();
        store.add("أول", None).unwrap();

        let before = store.snapshot();
        store.add("ثاني", None).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_search_by_text_and_id() {
        let (_dir, store) = create_test_store();
        store.add("Photosynthesis happens in leaves", None).unwrap();
        store.add("الماء يغلي عند مئة درجة", None).unwrap();

        assert_eq!(store.search("PHOTO", SearchBy::Text).len(), 1);
        assert_eq!(store.search("يغلي", SearchBy::Text).len(), 1);
        assert_eq!(store.search("", SearchBy::Text).len(), 2);
        assert_eq!(store.search("2", SearchBy::Id)[0].id, 2);
        assert!(store.search("abc", SearchBy::Id).is_empty());
    }

    #[test]
    fn test_search_by_parse() {
        assert_eq!("text".parse::<SearchBy>().unwrap(), SearchBy::Text);
        assert_eq!(" ID ".parse::<SearchBy>().unwrap(), SearchBy::Id);
        assert!("vector".parse::<SearchBy>().is_err());
    }

    #[test]
    fn test_malformed_document_reinitializes_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("knowledge.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = KnowledgeStore::open(&path).unwrap();
        assert!(store.list().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "[]");
    }

    #[test]
    fn test_legacy_file_url_alias() {
        let raw = r#"[{"id": 1, "content": "صورة", "file_url": "/static/uploads/a.png"}]"#;
        let records = parse_document(raw).unwrap();
        assert_eq!(records[0].media_ref.as_deref(), Some("/static/uploads/a.png"));
    }

    #[test]
    fn test_document_round_trip() {
        let document = r#"[
  {
    "id": 1,
    "content": "الخلية هي وحدة بناء الكائن الحي",
    "media_ref": null
  },
  {
    "id": 2,
    "content": "",
    "media_ref": "/static/uploads/1700000000_cell.png"
  }
]"#;

        let records = parse_document(document).unwrap();
        assert_eq!(render_document(&records).unwrap(), document);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("knowledge.json");
        {
            let store = KnowledgeStore::open(&path).unwrap();
            store.add("محفوظ", Some("img.png".to_string())).unwrap();
        }

        let store = KnowledgeStore::open(&path).unwrap();
        let records = store.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "محفوظ");
        assert_eq!(records[0].media_ref.as_deref(), Some("img.png"));
    }

    #[test]
    fn test_sync_from_disk_picks_up_external_edit() {
        let (_dir, store) = create_test_store();
        store.add("داخلي", None).unwrap();
        assert!(!store.sync_from_disk().unwrap());

        // mtime 해상도가 낮은 파일시스템 대비
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let edited = r#"[{"id": 1, "content": "خارجي", "media_ref": null},
                         {"id": 2, "content": "إضافي", "media_ref": null}]"#;
        std::fs::write(store.path(), edited).unwrap();

        let before = store.revision();
        assert!(store.sync_from_disk().unwrap());
        assert_eq!(store.revision(), before + 1);
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.get(1).unwrap().content, "خارجي");
    }

    #[test]
    fn test_sync_from_disk_ignores_malformed_edit() {
        let (_dir, store) = create_test_store();
        store.add("سليم", None).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        std::fs::write(store.path(), "[{broken").unwrap();

        assert!(!store.sync_from_disk().unwrap());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = create_test_store();
        store.add("1234567890", None).unwrap();
        store.add("", Some("a.png".to_string())).unwrap();

        let stats = store.stats();
        assert_eq!(stats.record_count, 2);
        assert_eq!(stats.media_count, 1);
        assert_eq!(stats.total_content_bytes, 10);
        assert!(stats.last_modified.is_some());
    }
}
