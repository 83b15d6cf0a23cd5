#![allow(dead_code)]

use quire::orchestrator::{OrchestratorSettings, ServiceConfig, ServiceOrchestrator, ServiceRequest};
use quire::security::SecurityContext;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An orchestrator with default settings and `services` registered.
pub fn orchestrator(services: Vec<ServiceConfig>) -> ServiceOrchestrator {
    let orchestrator = ServiceOrchestrator::new(OrchestratorSettings::default());
    for service in services {
        orchestrator.register_service(service).unwrap();
    }
    orchestrator
}

pub fn caller(ip: &str) -> SecurityContext {
    SecurityContext {
        ip: Some(ip.to_string()),
        user_agent: Some("test-suite".into()),
        ..SecurityContext::default()
    }
}

/// A JSON request for `operation` from `ip`.
pub fn request(operation: &str, payload: Value, ip: &str) -> ServiceRequest<Value> {
    ServiceRequest::new(operation, payload).from_caller(caller(ip))
}

pub fn chapter(n: u32) -> Value {
    json!({ "chapter": n })
}

/// Counts how many times handlers built from it actually ran.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
