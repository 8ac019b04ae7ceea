//! Service-typed registry operations.
//!
//! All mutations share the same transactional shape: read, check, bump the
//! global counter, write, publish after commit. Kind-specific behavior
//! (bucket, defaulting, validation) comes from a descriptor so further kinds
//! can reuse the plumbing.

use caravel_core::{
    object_key, Error, ResourceMeta, Service, Strategy, TypeMeta, SERVICE_KIND,
};
use caravel_store::{
    current_resource_version, next_resource_version, scan_prefix, StoreError, SERVICES_TABLE,
};
use chrono::Utc;
use redb::{ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use crate::{internal, Event, EventType, Registry};

/// Everything the generic write path needs to know about a kind.
struct KindDescriptor {
    table: TableDefinition<'static, &'static str, &'static [u8]>,
    kind: &'static str,
    default_fn: fn(&mut Service),
    validate_fn: fn(&Service) -> Vec<String>,
}

const SERVICE_DESCRIPTOR: KindDescriptor = KindDescriptor {
    table: SERVICES_TABLE,
    kind: SERVICE_KIND,
    default_fn: default_service,
    validate_fn: validate_service,
};

impl Registry {
    /// Stores a new service. Rejects a caller-supplied resourceVersion, an
    /// invalid spec, or an existing key. Assigns uid, creationTimestamp,
    /// generation 1 and a fresh resourceVersion, then publishes `Added`.
    pub fn create(&self, mut service: Service) -> Result<Service, Error> {
        let desc = &SERVICE_DESCRIPTOR;
        (desc.default_fn)(&mut service);
        let mut errs = (desc.validate_fn)(&service);
        if !service.metadata.resource_version.is_empty() {
            errs.push("metadata.resourceVersion: must not be set on create".to_string());
        }
        if !errs.is_empty() {
            return Err(Error::Invalid {
                name: service.metadata.name.clone(),
                field_errors: errs,
            });
        }

        let key = service.key();
        let stored = self.store().update(|txn| {
            let mut table = txn.open_table(desc.table).map_err(internal)?;
            if table.get(key.as_str()).map_err(internal)?.is_some() {
                return Err(Error::AlreadyExists(key.clone()));
            }

            let rv = next_resource_version(txn)?;
            service.type_meta = TypeMeta::for_kind(desc.kind);
            service.metadata.resource_version = rv.to_string();
            service.metadata.uid = Uuid::new_v4().to_string();
            service.metadata.creation_timestamp = Some(Utc::now());
            service.metadata.generation = 1;

            let buf = serde_json::to_vec(&service).map_err(StoreError::from)?;
            table
                .insert(key.as_str(), buf.as_slice())
                .map_err(internal)?;
            Ok(service.clone())
        })?;

        debug!(key = %key, rv = %stored.metadata.resource_version, "service created");
        self.publish(Event {
            event_type: EventType::Added,
            key,
            resource_version: stored.metadata.resource_version.clone(),
            object: stored.clone(),
        });
        Ok(stored)
    }

    /// Replaces the spec and mutable metadata of an existing service under
    /// optimistic concurrency: the caller's resourceVersion must match the
    /// stored one. uid, creationTimestamp and the stored status are
    /// preserved; generation is bumped iff the spec changed. Publishes
    /// `Modified`.
    pub fn update(&self, mut service: Service) -> Result<Service, Error> {
        let desc = &SERVICE_DESCRIPTOR;
        let supplied_rv = service.metadata.resource_version.clone();
        if supplied_rv.is_empty() {
            return Err(Error::Invalid {
                name: service.metadata.name.clone(),
                field_errors: vec![
                    "metadata.resourceVersion: required for an update".to_string()
                ],
            });
        }
        (desc.default_fn)(&mut service);
        let errs = (desc.validate_fn)(&service);
        if !errs.is_empty() {
            return Err(Error::Invalid {
                name: service.metadata.name.clone(),
                field_errors: errs,
            });
        }

        let key = service.key();
        let stored = self.store().update(|txn| {
            let mut table = txn.open_table(desc.table).map_err(internal)?;
            let current = read_object(&table, &key)?;
            if current.metadata.resource_version != supplied_rv {
                return Err(Error::Conflict(format!(
                    "{}: object has been modified; apply your changes to the latest version",
                    key
                )));
            }

            let rv = next_resource_version(txn)?;
            service.type_meta = TypeMeta::for_kind(desc.kind);
            service.metadata.resource_version = rv.to_string();
            service.metadata.uid = current.metadata.uid.clone();
            service.metadata.creation_timestamp = current.metadata.creation_timestamp;
            service.metadata.generation = if service.spec != current.spec {
                current.metadata.generation + 1
            } else {
                current.metadata.generation
            };
            // Spec writes never touch status.
            service.status = current.status;

            let buf = serde_json::to_vec(&service).map_err(StoreError::from)?;
            table
                .insert(key.as_str(), buf.as_slice())
                .map_err(internal)?;
            Ok(service.clone())
        })?;

        debug!(key = %key, rv = %stored.metadata.resource_version, "service updated");
        self.publish(Event {
            event_type: EventType::Modified,
            key,
            resource_version: stored.metadata.resource_version.clone(),
            object: stored.clone(),
        });
        Ok(stored)
    }

    /// Overwrites only the status of the stored object; spec and metadata are
    /// taken from the store. Used by controllers to report observations
    /// without racing user spec edits, so no resourceVersion precondition.
    pub fn update_status(&self, service: &Service) -> Result<Service, Error> {
        let desc = &SERVICE_DESCRIPTOR;
        let key = service.key();
        let stored = self.store().update(|txn| {
            let mut table = txn.open_table(desc.table).map_err(internal)?;
            let mut updated = read_object(&table, &key)?;
            updated.status = service.status.clone();

            let rv = next_resource_version(txn)?;
            updated.metadata.resource_version = rv.to_string();

            let buf = serde_json::to_vec(&updated).map_err(StoreError::from)?;
            table
                .insert(key.as_str(), buf.as_slice())
                .map_err(internal)?;
            Ok::<Service, Error>(updated)
        })?;

        debug!(key = %key, rv = %stored.metadata.resource_version, "service status updated");
        self.publish(Event {
            event_type: EventType::Modified,
            key,
            resource_version: stored.metadata.resource_version.clone(),
            object: stored.clone(),
        });
        Ok(stored)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<Service, Error> {
        let desc = &SERVICE_DESCRIPTOR;
        let key = object_key(namespace, name);
        self.store().view(|txn| {
            let table = txn.open_table(desc.table).map_err(internal)?;
            read_object(&table, &key)
        })
    }

    /// Lists services under `namespace` (empty = all namespaces) together
    /// with the global resourceVersion, both read from the same snapshot.
    pub fn list(&self, namespace: &str) -> Result<(Vec<Service>, String), Error> {
        let desc = &SERVICE_DESCRIPTOR;
        let prefix = if namespace.is_empty() {
            String::new()
        } else {
            format!("{}/", namespace)
        };
        self.store().view(|txn| {
            let table = txn.open_table(desc.table).map_err(internal)?;
            let rows = scan_prefix(&table, &prefix)?;
            let mut services = Vec::with_capacity(rows.len());
            for (key, value) in rows {
                match serde_json::from_slice::<Service>(&value) {
                    Ok(svc) => services.push(svc),
                    // Skip the damaged row rather than failing the whole list.
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "failed to decode stored service")
                    }
                }
            }
            let rv = current_resource_version(txn)?;
            Ok((services, rv.to_string()))
        })
    }

    /// Removes a service, bumping the counter, and publishes `Deleted` with
    /// the pre-delete object. Deleting an absent key is a no-op.
    pub fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let desc = &SERVICE_DESCRIPTOR;
        let key = object_key(namespace, name);
        let deleted: Option<Service> = self.store().update(|txn| {
            let mut table = txn.open_table(desc.table).map_err(internal)?;
            let existing = match table.get(key.as_str()).map_err(internal)? {
                Some(guard) => {
                    serde_json::from_slice::<Service>(guard.value()).map_err(StoreError::from)?
                }
                None => return Ok::<Option<Service>, Error>(None),
            };
            table.remove(key.as_str()).map_err(internal)?;
            next_resource_version(txn)?;
            Ok(Some(existing))
        })?;

        if let Some(object) = deleted {
            debug!(key = %key, "service deleted");
            self.publish(Event {
                event_type: EventType::Deleted,
                key,
                resource_version: object.metadata.resource_version.clone(),
                object,
            });
        }
        Ok(())
    }
}

fn read_object(
    table: &impl redb::ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Service, Error> {
    match table.get(key).map_err(internal)? {
        Some(guard) => serde_json::from_slice(guard.value()).map_err(internal),
        None => Err(Error::NotFound(key.to_string())),
    }
}

/// Fills optional fields the way the platform expects them.
fn default_service(service: &mut Service) {
    if service.metadata.namespace.is_empty() {
        service.metadata.namespace = "default".to_string();
    }
    if service.spec.template.hostname.is_empty() {
        service.spec.template.hostname = service.metadata.name.clone();
    }
}

/// Pure validation; returns per-field reasons.
fn validate_service(service: &Service) -> Vec<String> {
    let mut errs = Vec::new();
    if service.metadata.name.is_empty() {
        errs.push("metadata.name: required".to_string());
    }
    if service.metadata.name.contains('/') {
        errs.push("metadata.name: must not contain '/'".to_string());
    }

    let image = &service.spec.template.image;
    if image.is_empty() {
        errs.push("spec.template.image: required".to_string());
    } else {
        match image.split_once('@') {
            Some((name, tag)) if !name.is_empty() && !tag.is_empty() => {}
            _ => errs.push(format!(
                "spec.template.image: {:?} is not in name@tag form",
                image
            )),
        }
    }

    match &service.spec.strategy {
        Strategy::Static { nodes } => {
            if nodes.is_empty() {
                errs.push("spec.strategy.nodes: at least one node required".to_string());
            }
        }
        Strategy::Dynamic { replicas, .. } => {
            if *replicas < 1 {
                errs.push(format!("spec.strategy.replicas: must be >= 1, got {}", replicas));
            }
        }
    }

    if let Some(probe) = &service.spec.template.probe {
        for (field, value) in [
            ("initialDelaySeconds", probe.initial_delay_seconds),
            ("timeoutSeconds", probe.timeout_seconds),
            ("periodSeconds", probe.period_seconds),
            ("failureThreshold", probe.failure_threshold),
        ] {
            if value < 0 {
                errs.push(format!("spec.template.probe.{}: must not be negative", field));
            }
        }
    }

    errs
}
