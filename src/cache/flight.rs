//! シングルフライト
//!
//! 同じキーへの同時ミスを1回のオリジンフェッチにまとめます。
//! 最初の呼び出し元（リーダー）がフェッチタスクを起動し、
//! 後続の呼び出し元は同じフライトに待機者として参加します。
//!
//! ```text
//! join(k) ─┬─ Vacant   → 新しいフライト（リーダー）
//!          └─ Occupied → 同じキー: 待機者として参加
//!                        別キー（ハッシュ衝突）: テーブル外の単独フライト
//! ```
//!
//! 待機者は `Waiter` のドロップで離脱し、全員が離脱したフライトは
//! `is_abandoned()` で検出できます。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// 進行中のフェッチ
pub struct InFlightFetch<T> {
    key: Box<str>,
    hash: u64,
    state: Mutex<FlightState<T>>,
    waiters: AtomicUsize,
}

struct FlightState<T> {
    result: Option<T>,
    wakers: Vec<Waker>,
}

impl<T: Clone> InFlightFetch<T> {
    fn new(hash: u64, key: &str) -> Self {
        Self {
            key: key.into(),
            hash,
            state: Mutex::new(FlightState {
                result: None,
                wakers: Vec::new(),
            }),
            waiters: AtomicUsize::new(1),
        }
    }

    /// キャッシュキー
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 現在の待機者数
    #[inline]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// 待機者が全員離脱したか
    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.waiters() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlightState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// フライトへの参加権
///
/// ドロップで待機者数を減らす
pub struct Waiter<T: Clone> {
    flight: Arc<InFlightFetch<T>>,
    leader: bool,
}

impl<T: Clone> Waiter<T> {
    /// フェッチタスクを起動する役割か
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    #[inline]
    pub fn flight(&self) -> &Arc<InFlightFetch<T>> {
        &self.flight
    }

    /// 結果を待つ
    pub fn wait(&self) -> WaitFlight<'_, T> {
        WaitFlight { flight: &self.flight }
    }
}

impl<T: Clone> Drop for Waiter<T> {
    fn drop(&mut self) {
        self.flight.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 結果待ちのFuture
pub struct WaitFlight<'a, T> {
    flight: &'a InFlightFetch<T>,
}

impl<T: Clone> Future for WaitFlight<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.flight.lock();
        if let Some(result) = &state.result {
            return Poll::Ready(result.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// フライトテーブル
pub struct InFlightTable<T> {
    flights: DashMap<u64, Arc<InFlightFetch<T>>>,
    /// 既存フライトに合流した回数
    collapsed: AtomicU64,
}

impl<T: Clone> InFlightTable<T> {
    pub fn new() -> Self {
        Self {
            flights: DashMap::new(),
            collapsed: AtomicU64::new(0),
        }
    }

    /// フライトに参加（なければ作成してリーダーになる）
    pub fn join(&self, hash: u64, key: &str) -> Waiter<T> {
        match self.flights.entry(hash) {
            Entry::Occupied(occupied) => {
                let flight = occupied.get();
                if &*flight.key == key {
                    flight.waiters.fetch_add(1, Ordering::AcqRel);
                    self.collapsed.fetch_add(1, Ordering::Relaxed);
                    return Waiter {
                        flight: Arc::clone(flight),
                        leader: false,
                    };
                }
                // ハッシュ衝突: テーブルに登録しない単独フライト
                Waiter {
                    flight: Arc::new(InFlightFetch::new(hash, key)),
                    leader: true,
                }
            }
            Entry::Vacant(vacant) => {
                let flight = Arc::new(InFlightFetch::new(hash, key));
                vacant.insert(Arc::clone(&flight));
                Waiter {
                    flight,
                    leader: true,
                }
            }
        }
    }

    /// 結果を確定して待機者を起こす
    ///
    /// 2回目以降の呼び出しは無視される
    pub fn complete(&self, flight: &Arc<InFlightFetch<T>>, result: T) {
        let wakers = {
            let mut state = flight.lock();
            if state.result.is_some() {
                return;
            }
            state.result = Some(result);
            std::mem::take(&mut state.wakers)
        };

        self.flights
            .remove_if(&flight.hash, |_, f| Arc::ptr_eq(f, flight));

        for waker in wakers {
            waker.wake();
        }
    }

    /// 進行中のフライト数
    #[inline]
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// 合流した待機者の累計
    #[inline]
    pub fn collapsed(&self) -> u64 {
        self.collapsed.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Default for InFlightTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
