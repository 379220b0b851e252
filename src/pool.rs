// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded object pools with rent/return lifecycle hooks.
//!
//! Requests, responses and listener contexts are pooled so the per-message
//! buffers they own are allocated once and reused. The pool exclusively owns
//! cached instances; the caller exclusively owns a rented instance until it
//! is reclaimed. Reclaimed instances beyond the quota, and instances whose
//! pre-return hook vetoes caching, are dropped.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, ThreadId};

type Ctor<T> = Box<dyn Fn() -> T + Send + Sync>;
type RentHook<T> = Box<dyn Fn(&mut T) + Send + Sync>;
type ReturnHook<T> = Box<dyn Fn(&mut T) -> bool + Send + Sync>;

/// A thread-safe LIFO pool of reusable instances.
pub struct ObjectPool<T> {
  cache: Mutex<Vec<T>>,
  quota: usize,
  ctor: Ctor<T>,
  on_rent: Option<RentHook<T>>,
  on_return: Option<ReturnHook<T>>,
}

impl<T> ObjectPool<T> {
  pub fn new(
    quota: usize,
    ctor: impl Fn() -> T + Send + Sync + 'static,
  ) -> Self {
    Self {
      cache: Mutex::new(Vec::new()),
      quota,
      ctor: Box::new(ctor),
      on_rent: None,
      on_return: None,
    }
  }

  /// Runs after every rent, on cached and fresh instances alike.
  pub fn on_rent(
    mut self,
    hook: impl Fn(&mut T) + Send + Sync + 'static,
  ) -> Self {
    self.on_rent = Some(Box::new(hook));
    self
  }

  /// Runs before an instance re-enters the cache; returning `false` drops
  /// the instance instead.
  pub fn on_return(
    mut self,
    hook: impl Fn(&mut T) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.on_return = Some(Box::new(hook));
    self
  }

  /// Pops a cached instance or constructs a fresh one.
  pub fn rent(&self) -> T {
    let cached = self.lock().pop();
    let mut item = cached.unwrap_or_else(|| (self.ctor)());
    if let Some(hook) = &self.on_rent {
      hook(&mut item);
    }
    item
  }

  /// Hands an instance back. Cached while under quota, dropped otherwise.
  pub fn reclaim(&self, mut item: T) {
    if let Some(hook) = &self.on_return {
      if !hook(&mut item) {
        return;
      }
    }
    let mut cache = self.lock();
    if cache.len() < self.quota {
      cache.push(item);
    }
  }

  /// Drops every cached instance.
  pub fn clear(&self) {
    self.lock().clear();
  }

  pub fn cached(&self) -> usize {
    self.lock().len()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
    // A panic while holding the lock leaves only cached instances behind;
    // the cache itself stays valid.
    self.cache.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// A pool variant keeping one cached instance per thread.
pub struct ThreadCachedPool<T> {
  slots: Mutex<HashMap<ThreadId, T>>,
  ctor: Ctor<T>,
  on_rent: Option<RentHook<T>>,
  on_return: Option<ReturnHook<T>>,
}

impl<T> ThreadCachedPool<T> {
  pub fn new(ctor: impl Fn() -> T + Send + Sync + 'static) -> Self {
    Self {
      slots: Mutex::new(HashMap::new()),
      ctor: Box::new(ctor),
      on_rent: None,
      on_return: None,
    }
  }

  pub fn on_rent(
    mut self,
    hook: impl Fn(&mut T) + Send + Sync + 'static,
  ) -> Self {
    self.on_rent = Some(Box::new(hook));
    self
  }

  pub fn on_return(
    mut self,
    hook: impl Fn(&mut T) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.on_return = Some(Box::new(hook));
    self
  }

  /// Takes the calling thread's slot, constructing when it is empty.
  pub fn rent(&self) -> T {
    let cached = self.lock().remove(&thread::current().id());
    let mut item = cached.unwrap_or_else(|| (self.ctor)());
    if let Some(hook) = &self.on_rent {
      hook(&mut item);
    }
    item
  }

  /// Refills the calling thread's slot. A vetoing return hook replaces the
  /// slot with a freshly constructed instance and drops the old one.
  pub fn reclaim(&self, mut item: T) {
    if let Some(hook) = &self.on_return {
      if !hook(&mut item) {
        item = (self.ctor)();
      }
    }
    self.lock().insert(thread::current().id(), item);
  }

  pub fn clear(&self) {
    self.lock().clear();
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, T>> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
