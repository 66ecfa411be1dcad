//! Lazy, page-by-page readers over an [`EventStore`].
//!
//! Both readers capture the tail (stream version or head) on their first page and
//! stop there, so iteration always terminates even while writers keep appending.
//! A reader can be restarted from any version by constructing a new one.

use std::collections::VecDeque;

use stocklens_core::{GlobalVersion, StreamId, StreamVersion};
use stocklens_events::EventEnvelope;

use super::r#trait::{EventStore, EventStoreError};

pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Iterates one stream in `stream_version` order.
pub struct StreamReader<'s, S: EventStore + ?Sized> {
    store: &'s S,
    stream_id: StreamId,
    next: StreamVersion,
    page_size: usize,
    tail: Option<StreamVersion>,
    buffer: VecDeque<EventEnvelope>,
    done: bool,
}

impl<'s, S: EventStore + ?Sized> StreamReader<'s, S> {
    pub fn new(store: &'s S, stream_id: StreamId, from_version: StreamVersion, page_size: usize) -> Self {
        Self {
            store,
            stream_id,
            next: from_version.max(1),
            page_size: page_size.max(1),
            tail: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn fill(&mut self) -> Result<(), EventStoreError> {
        let tail = match self.tail {
            Some(t) => t,
            None => {
                let t = self.store.stream_version(&self.stream_id)?;
                self.tail = Some(t);
                t
            }
        };
        if self.next > tail {
            self.done = true;
            return Ok(());
        }

        let remaining = (tail - self.next + 1) as usize;
        let page = self
            .store
            .read_stream_page(&self.stream_id, self.next, self.page_size.min(remaining))?;
        match page.last() {
            Some(last) => self.next = last.stream_version() + 1,
            None => self.done = true,
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: EventStore + ?Sized> Iterator for StreamReader<'_, S> {
    type Item = Result<EventEnvelope, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(env) = self.buffer.pop_front() {
                return Some(Ok(env));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Iterates the whole store in `global_version` order.
pub struct GlobalReader<'s, S: EventStore + ?Sized> {
    store: &'s S,
    next: GlobalVersion,
    page_size: usize,
    tail: Option<GlobalVersion>,
    buffer: VecDeque<EventEnvelope>,
    done: bool,
}

impl<'s, S: EventStore + ?Sized> GlobalReader<'s, S> {
    pub fn new(store: &'s S, from_global_version: GlobalVersion, page_size: usize) -> Self {
        Self {
            store,
            next: from_global_version.max(1),
            page_size: page_size.max(1),
            tail: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Stop at `head` instead of the head observed on the first page.
    pub fn until(mut self, head: GlobalVersion) -> Self {
        self.tail = Some(head);
        self
    }

    fn fill(&mut self) -> Result<(), EventStoreError> {
        let tail = match self.tail {
            Some(t) => t,
            None => {
                let t = self.store.head()?;
                self.tail = Some(t);
                t
            }
        };
        if self.next > tail {
            self.done = true;
            return Ok(());
        }

        let remaining = (tail - self.next + 1) as usize;
        let page = self.store.read_global(self.next, self.page_size.min(remaining))?;
        match page.last() {
            Some(last) => self.next = last.global_version() + 1,
            None => self.done = true,
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<S: EventStore + ?Sized> Iterator for GlobalReader<'_, S> {
    type Item = Result<EventEnvelope, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(env) = self.buffer.pop_front() {
                return Some(Ok(env));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}
