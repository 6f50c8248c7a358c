#![allow(unused)]

use crate::task::{Id, Priority};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Schedule,
    Promote,
    Steal,
    Interrupt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Schedule {
        id: Id,
        priority: Priority,
        affinity: Option<u16>,
    },
    Promote {
        id: Id,
    },
    Steal {
        id: Id,
        thief: u16,
    },
    Interrupt {
        main_only: bool,
    },
}

/// Small price to pay to get introspection on scheduling decisions during
/// testing. No op in release builds.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::Schedule, Vec::new());
        map.insert(Method::Promote, Vec::new());
        map.insert(Method::Steal, Vec::new());
        map.insert(Method::Interrupt, Vec::new());

        Self { calls: Arc::new(map) }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}
