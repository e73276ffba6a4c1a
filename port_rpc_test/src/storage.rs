use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use may::go;
use may::sync::Mutex;
use port_rpc::{Emitter, ErrorCode, Observable, Router, RpcError, Unsubscribe};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// per request context
pub struct Ctx {
    pub caller: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Value,
}

/// in memory preferences shared by every caller
#[derive(Default)]
pub struct Store {
    values: Mutex<HashMap<String, Value>>,
    watchers: Mutex<HashMap<u64, Emitter>>,
    next_watcher: AtomicU64,
}

impl Store {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().unwrap().get(key).cloned()
    }

    fn set(&self, entry: Entry) -> Result<bool, RpcError> {
        if entry.key.starts_with('_') {
            return Err(RpcError::new(
                ErrorCode::Forbidden,
                format!("key \"{}\" is read only", entry.key),
            ));
        }
        let changed = self.values.lock().unwrap().insert(entry.key.clone(), entry.value.clone())
            != Some(entry.value.clone());
        if changed {
            for emitter in self.watchers.lock().unwrap().values() {
                emitter.next(&entry);
            }
        }
        Ok(changed)
    }

    fn watch(self: &Arc<Self>) -> Observable {
        let store = self.clone();
        Observable::new(move |emitter| {
            let id = store.next_watcher.fetch_add(1, Ordering::Relaxed);
            store.watchers.lock().unwrap().insert(id, emitter);
            Ok(Box::new(move || {
                store.watchers.lock().unwrap().remove(&id);
                Ok(())
            }) as Unsubscribe)
        })
    }
}

/// emit `0..n` every `interval_ms`, then complete
fn ticks(n: u32, interval_ms: u64) -> Observable {
    Observable::new(move |emitter| {
        let stop = Arc::new(AtomicBool::new(false));
        let stopped = stop.clone();
        go!(move || {
            for i in 0..n {
                if stopped.load(Ordering::Acquire) || !emitter.next(i) {
                    return;
                }
                may::coroutine::sleep(Duration::from_millis(interval_ms));
            }
            emitter.complete();
        });
        Ok(Box::new(move || {
            stop.store(true, Ordering::Release);
            Ok(())
        }) as Unsubscribe)
    })
}

pub fn router(store: Arc<Store>) -> Router<Ctx> {
    let get_store = store.clone();
    let set_store = store.clone();
    Router::new()
        .nest(
            "storage",
            Router::new()
                .query("get", move |_, key: String| {
                    Ok::<_, RpcError>(get_store.get(&key))
                })
                .mutation("set", move |_, entry: Entry| set_store.set(entry))
                .subscription("watch", move |_, _: ()| Ok::<_, RpcError>(store.watch())),
        )
        .query("whoami", |ctx: &Ctx, _: ()| Ok::<_, RpcError>(ctx.caller.clone()))
        .query("slow", |_, ms: u64| {
            may::coroutine::sleep(Duration::from_millis(ms));
            Ok::<_, RpcError>(ms)
        })
        .subscription("ticks", |_, (n, interval_ms): (u32, u64)| {
            Ok::<_, RpcError>(ticks(n, interval_ms))
        })
}
