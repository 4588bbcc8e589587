//! Buffer de replay com tamanho fixo (o mais antigo é descartado).

use crate::types::TelemetryRecord;
use std::collections::VecDeque;

/// Últimos N registros relayados.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    records: VecDeque<TelemetryRecord>,
    capacity: usize,
}

impl ReplayBuffer {
    /// `capacity == 0` desativa o buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: TelemetryRecord) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Registros do mais antigo ao mais novo.
    pub fn iter(&self) -> impl Iterator<Item = &TelemetryRecord> {
        self.records.iter()
    }
}
