//! 连接级属性表：过滤器暂存半包、协商阶段等私有状态的位置。
//!
//! # 契约说明（What）
//! - 键由 `(名称, 值类型)` 共同确定，两个过滤器即使选了同名键也不会互相覆盖；
//! - 取值采用“取出-处理-放回”模式（[`AttributeMap::take`] / [`AttributeMap::insert`]），
//!   避免在调用下游过滤器期间持有表锁。
//!
//! # 风险提示（Trade-offs）
//! - 表锁为 `parking_lot::Mutex`，只在存取瞬间持有；过滤器处理期间状态不在表中，
//!   同一连接的读事件由唯一反应器线程串行派发，因此不会出现并发取用。

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    marker::PhantomData,
};

use parking_lot::Mutex;

/// 类型化属性键。
///
/// ```rust
/// use fai_core::attribute::{AttributeKey, AttributeMap};
///
/// const COUNTER: AttributeKey<u32> = AttributeKey::new("demo.counter");
/// let map = AttributeMap::default();
/// map.insert(&COUNTER, 1);
/// assert_eq!(map.get(&COUNTER), Some(1));
/// ```
pub struct AttributeKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttributeKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for AttributeKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.name).finish()
    }
}

type Slot = (&'static str, TypeId);

/// 每条连接一份的键值暂存区。
#[derive(Default)]
pub struct AttributeMap {
    entries: Mutex<HashMap<Slot, Box<dyn Any + Send>>>,
}

impl AttributeMap {
    /// 写入值，返回被替换的旧值。
    pub fn insert<T: Send + 'static>(&self, key: &AttributeKey<T>, value: T) -> Option<T> {
        self.entries
            .lock()
            .insert(slot(key), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|boxed| *boxed))
    }

    /// 取出值，表中不再保留。
    pub fn take<T: Send + 'static>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.entries
            .lock()
            .remove(&slot(key))
            .and_then(|value| value.downcast::<T>().ok().map(|boxed| *boxed))
    }

    /// 克隆读取。
    pub fn get<T: Clone + Send + 'static>(&self, key: &AttributeKey<T>) -> Option<T> {
        self.entries
            .lock()
            .get(&slot(key))
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// 在锁内原地修改已有值；键不存在时返回 `None`。
    pub fn with_mut<T: Send + 'static, R>(
        &self,
        key: &AttributeKey<T>,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        self.entries
            .lock()
            .get_mut(&slot(key))
            .and_then(|value| value.downcast_mut::<T>())
            .map(f)
    }

    pub fn contains<T: 'static>(&self, key: &AttributeKey<T>) -> bool {
        self.entries.lock().contains_key(&slot(key))
    }

    pub fn remove<T: 'static>(&self, key: &AttributeKey<T>) -> bool {
        self.entries.lock().remove(&slot(key)).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 连接关闭时清空，释放过滤器遗留的半包缓冲。
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl fmt::Debug for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self.entries.lock().keys().map(|(name, _)| *name).collect();
        f.debug_struct("AttributeMap").field("keys", &names).finish()
    }
}

fn slot<T: 'static>(key: &AttributeKey<T>) -> Slot {
    (key.name, TypeId::of::<T>())
}
