// Copyright (c) latticedb.dev 2025
// This file is licensed under the AGPL-3.0-or-later, see license.md file

/// Per-field sort direction inside an encoded key. Descending fields are
/// stored byte-inverted so that plain memcmp order realises the reversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Shape of the keys stored under one storage unit: how many logical
/// fields a full key carries, the sort order of each, and how many of the
/// trailing fields form the primary key (used to derive the shared short
/// prefix for index probes).
#[derive(Debug, Clone, PartialEq)]
pub struct KeyInfo {
    orders: Vec<SortOrder>,
    n_pk: usize,
}

impl KeyInfo {
    /// All-ascending key with `n_field` fields and no trailing PK fields.
    pub fn new(n_field: usize) -> Self {
        Self { orders: vec![SortOrder::Asc; n_field], n_pk: 0 }
    }

    pub fn with_orders(orders: Vec<SortOrder>) -> Self {
        Self { orders, n_pk: 0 }
    }

    /// Mark the trailing `n_pk` fields as the primary-key suffix.
    pub fn with_pk(mut self, n_pk: usize) -> Self {
        assert!(n_pk <= self.orders.len());
        self.n_pk = n_pk;
        self
    }

    pub fn n_field(&self) -> usize {
        self.orders.len()
    }

    pub fn n_pk(&self) -> usize {
        self.n_pk
    }

    /// Number of leading fields that are not part of the PK suffix.
    pub fn n_short(&self) -> usize {
        self.orders.len() - self.n_pk
    }

    /// Sort order of field `i`; fields beyond the declared set sort
    /// ascending.
    pub fn order(&self, i: usize) -> SortOrder {
        self.orders.get(i).copied().unwrap_or(SortOrder::Asc)
    }
}
