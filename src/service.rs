// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CRUD layer.
//!
//! Every mutation commits locally first, then consults the request's
//! [`ReplicationContext`]: a local request is broadcast through the
//! [`EventPublisher`], a replay is not. Publish failures never fail the
//! mutation; the caller's response depends on local persistence only.

use crate::error::Result;
use crate::event::{EventType, Lifecycle, ResourceKind};
use crate::guard::ReplicationContext;
use crate::metrics;
use crate::publisher::EventPublisher;
use crate::resources::{
    Pagination, Shipment, ShipmentCreate, ShipmentUpdate, Warehouse, WarehouseCreate,
    WarehouseUpdate,
};
use crate::store::LogisticsStore;
use std::sync::Arc;
use tracing::debug;

pub struct LogisticsService {
    store: Arc<LogisticsStore>,
    publisher: Arc<EventPublisher>,
}

impl LogisticsService {
    pub fn new(store: Arc<LogisticsStore>, publisher: Arc<EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Arc<LogisticsStore> {
        &self.store
    }

    /// Whether a committed mutation must be broadcast. Logs and counts suppression.
    fn should_broadcast(&self, ctx: &ReplicationContext, kind: ResourceKind, stage: Lifecycle) -> bool {
        if ctx.should_publish() {
            return true;
        }
        let event_type = EventType::new(kind, stage).to_string();
        let source = ctx.source_node.as_deref().unwrap_or("");
        debug!(event_type = %event_type, source, "Replicated mutation, not broadcasting");
        metrics::record_broadcast_suppressed(&event_type, source);
        false
    }

    // =========================================================================
    // Warehouses
    // =========================================================================

    pub async fn create_warehouse(
        &self,
        ctx: &ReplicationContext,
        operation_tag: &str,
        input: &WarehouseCreate,
    ) -> Result<Warehouse> {
        let warehouse = self.store.create_warehouse(input).await?;
        if self.should_broadcast(ctx, ResourceKind::Warehouse, Lifecycle::Created) {
            self.publisher
                .warehouse_created(&warehouse.snapshot(), operation_tag)
                .await;
        }
        Ok(warehouse)
    }

    pub async fn list_warehouses(&self, page: Pagination) -> Result<Vec<Warehouse>> {
        self.store.list_warehouses(page).await
    }

    pub async fn get_warehouse(&self, id: i64) -> Result<Option<Warehouse>> {
        self.store.get_warehouse(id).await
    }

    pub async fn update_warehouse(
        &self,
        ctx: &ReplicationContext,
        operation_tag: &str,
        id: i64,
        update: &WarehouseUpdate,
    ) -> Result<Option<Warehouse>> {
        let Some(warehouse) = self.store.update_warehouse(id, update).await? else {
            return Ok(None);
        };
        if self.should_broadcast(ctx, ResourceKind::Warehouse, Lifecycle::Updated) {
            self.publisher
                .warehouse_updated(&warehouse.snapshot(), &update.changed_fields(), operation_tag)
                .await;
        }
        Ok(Some(warehouse))
    }

    pub async fn delete_warehouse(
        &self,
        ctx: &ReplicationContext,
        operation_tag: &str,
        id: i64,
    ) -> Result<bool> {
        if !self.store.delete_warehouse(id).await? {
            return Ok(false);
        }
        if self.should_broadcast(ctx, ResourceKind::Warehouse, Lifecycle::Deleted) {
            self.publisher.warehouse_deleted(id, operation_tag).await;
        }
        Ok(true)
    }

    // =========================================================================
    // Shipments
    // =========================================================================

    pub async fn create_shipment(
        &self,
        ctx: &ReplicationContext,
        operation_tag: &str,
        input: &ShipmentCreate,
    ) -> Result<Shipment> {
        let shipment = self.store.create_shipment(input).await?;
        if self.should_broadcast(ctx, ResourceKind::Shipment, Lifecycle::Created) {
            self.publisher
                .shipment_created(&shipment.snapshot(), operation_tag)
                .await;
        }
        Ok(shipment)
    }

    pub async fn list_shipments(&self, page: Pagination) -> Result<Vec<Shipment>> {
        self.store.list_shipments(page).await
    }

    pub async fn get_shipment(&self, id: i64) -> Result<Option<Shipment>> {
        self.store.get_shipment(id).await
    }

    pub async fn track_shipment(&self, tracking_number: &str) -> Result<Option<Shipment>> {
        self.store.find_shipment_by_tracking(tracking_number).await
    }

    pub async fn update_shipment(
        &self,
        ctx: &ReplicationContext,
        operation_tag: &str,
        id: i64,
        update: &ShipmentUpdate,
    ) -> Result<Option<Shipment>> {
        let Some(shipment) = self.store.update_shipment(id, update).await? else {
            return Ok(None);
        };
        if self.should_broadcast(ctx, ResourceKind::Shipment, Lifecycle::Updated) {
            self.publisher
                .shipment_updated(&shipment.snapshot(), &update.changed_fields(), operation_tag)
                .await;
        }
        Ok(Some(shipment))
    }

    pub async fn delete_shipment(
        &self,
        ctx: &ReplicationContext,
        operation_tag: &str,
        id: i64,
    ) -> Result<bool> {
        if !self.store.delete_shipment(id).await? {
            return Ok(false);
        }
        if self.should_broadcast(ctx, ResourceKind::Shipment, Lifecycle::Deleted) {
            self.publisher.shipment_deleted(id, operation_tag).await;
        }
        Ok(true)
    }
}
