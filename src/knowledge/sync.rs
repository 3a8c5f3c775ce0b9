//! Index Synchronizer - 스토어 변경 감지 후 인덱스 재빌드
//!
//! - `SnapshotHandle`: 현재 `IndexSnapshot`을 가리키는 공유 포인터.
//!   `current()`로 Arc를 복제해 가져가고, `publish()`로 통째로 교체합니다.
//!   이미 가져간 스냅샷은 교체와 무관하게 끝까지 유효합니다.
//! - `IndexSynchronizer`: 스토어 revision과 스냅샷의 `built_at`을 비교해
//!   달라졌으면 재빌드합니다. 동시에 하나의 재빌드만 실행됩니다.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;

use super::store::KnowledgeStore;
use super::vector::{IndexSnapshot, VectorIndex};

// ============================================================================
// SnapshotHandle
// ============================================================================

/// 현재 인덱스 스냅샷에 대한 공유 핸들
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<IndexSnapshot>>>,
}

impl SnapshotHandle {
    pub fn new(snapshot: IndexSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// 현재 스냅샷 (호출자가 소유하는 참조)
    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 새 스냅샷으로 교체
    pub fn publish(&self, snapshot: Arc<IndexSnapshot>) {
        let mut slot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *slot = snapshot;
    }

    /// 더 새로운 revision일 때만 교체 (늦게 끝난 재빌드가 최신 스냅샷을 덮지 않도록)
    fn publish_if_newer(&self, snapshot: Arc<IndexSnapshot>) -> bool {
        let mut slot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if snapshot.built_at() > slot.built_at() {
            *slot = snapshot;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// IndexSynchronizer
// ============================================================================

/// 재빌드 검사 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// 스토어가 바뀌지 않음
    Unchanged,
    /// 새 스냅샷 발행
    Rebuilt { revision: u64, records: usize },
    /// 변경 후 스토어가 비어 있어 이전 스냅샷 유지
    SkippedEmpty { revision: u64 },
    /// 빌드 도중 더 새로운 스냅샷이 발행되어 결과를 버림
    Superseded { revision: u64 },
    /// 다른 재빌드가 진행 중
    InProgress,
}

/// 재빌드 진행 플래그를 해제하는 가드
struct RebuildGuard<'a>(&'a AtomicBool);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// 스토어와 인덱스 스냅샷을 맞추는 동기화기
pub struct IndexSynchronizer {
    store: Arc<KnowledgeStore>,
    index: VectorIndex,
    handle: SnapshotHandle,
    rebuilding: AtomicBool,
    /// 빈 스토어 경고를 마지막으로 남긴 revision
    empty_warned_at: AtomicU64,
}

impl IndexSynchronizer {
    /// 현재 스토어 내용으로 첫 스냅샷을 만들어 생성
    pub async fn bootstrap(store: Arc<KnowledgeStore>, index: VectorIndex) -> Result<Arc<Self>> {
        let initial = index.build(&store.snapshot()).await?;
        tracing::info!(
            "Initial index built: {} records (revision {})",
            initial.len(),
            initial.built_at()
        );
        Ok(Arc::new(Self::with_snapshot(store, index, initial)))
    }

    /// 이미 만든 스냅샷으로 생성
    pub fn with_snapshot(store: Arc<KnowledgeStore>, index: VectorIndex, snapshot: IndexSnapshot) -> Self {
        Self {
            store,
            index,
            handle: SnapshotHandle::new(snapshot),
            rebuilding: AtomicBool::new(false),
            empty_warned_at: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.handle.current()
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// 스토어가 바뀌었으면 재빌드 후 발행
    pub async fn maybe_rebuild(&self) -> Result<RebuildOutcome> {
        if let Err(e) = self.store.sync_from_disk() {
            tracing::warn!("Knowledge file resync failed: {:#}", e);
        }

        if self.store.revision() == self.handle.current().built_at() {
            return Ok(RebuildOutcome::Unchanged);
        }

        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(RebuildOutcome::InProgress);
        }
        let _guard = RebuildGuard(&self.rebuilding);

        // 레코드는 한 번에 한 스냅샷에서만 읽음
        let store_snapshot = self.store.snapshot();
        let current = self.handle.current();
        if store_snapshot.revision == current.built_at() {
            return Ok(RebuildOutcome::Unchanged);
        }

        if store_snapshot.is_empty() && !current.is_empty() {
            let revision = store_snapshot.revision;
            if self.empty_warned_at.swap(revision, Ordering::AcqRel) != revision {
                tracing::warn!(
                    "Knowledge store is empty at revision {}, keeping previous index (revision {})",
                    revision,
                    current.built_at()
                );
            } else {
                tracing::debug!("Knowledge store still empty at revision {}", revision);
            }
            return Ok(RebuildOutcome::SkippedEmpty {
                revision: store_snapshot.revision,
            });
        }

        tracing::info!(
            "Knowledge store changed (revision {} -> {}), rebuilding index...",
            current.built_at(),
            store_snapshot.revision
        );

        let snapshot = Arc::new(self.index.build(&store_snapshot).await?);
        let records = snapshot.len();
        if !self.handle.publish_if_newer(snapshot) {
            tracing::debug!(
                "Discarding index for revision {}, a newer snapshot is already published",
                store_snapshot.revision
            );
            return Ok(RebuildOutcome::Superseded {
                revision: store_snapshot.revision,
            });
        }
        tracing::info!("Index rebuilt ({} records)", records);

        Ok(RebuildOutcome::Rebuilt {
            revision: store_snapshot.revision,
            records,
        })
    }

    /// 요청 경로에서 호출하는 비차단 검사
    ///
    /// 재빌드가 이미 돌고 있으면 아무것도 하지 않습니다.
    pub fn spawn_refresh(self: &Arc<Self>) {
        if self.is_rebuilding() {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.maybe_rebuild().await {
                Ok(outcome) => tracing::debug!("Background index check: {:?}", outcome),
                Err(e) => tracing::warn!("Background index rebuild failed: {:#}", e),
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
