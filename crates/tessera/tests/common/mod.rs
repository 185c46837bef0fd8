//! Shared fixtures: an order-entry model, a shipping model and a scripted
//! in-memory connection.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tessera::prelude::*;
use tessera::{AssociationSlot, CollectionSlot};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got a value"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn runtime() -> asupersync::runtime::Runtime {
    asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone)]
pub struct Customer {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Customer {
    const ENTITY_NAME: &'static str = "Customer";
    const TABLE_NAME: &'static str = "customers";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("name", "name"),
        ];
        FIELDS
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }
}

/// Keys come from the database.
#[derive(Debug, Clone)]
pub struct Product {
    pub id: Option<i64>,
    pub sku: String,
}

impl Entity for Product {
    const ENTITY_NAME: &'static str = "Product";
    const TABLE_NAME: &'static str = "products";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("sku", "sku"),
        ];
        FIELDS
    }

    fn id_strategy() -> IdStrategy {
        IdStrategy::Identity
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![("id", self.id.into()), ("sku", self.sku.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            sku: row.get_named("sku")?,
        })
    }
}

/// Versioned; the customer is never cascaded to, the product lines are.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: Option<i64>,
    pub number: String,
    pub version: i64,
    pub customer: Association<Customer>,
    pub products: Collection<Product>,
}

impl Entity for Order {
    const ENTITY_NAME: &'static str = "Order";
    const TABLE_NAME: &'static str = "orders";
    const VERSION_COLUMN: Option<&'static str> = Some("version");

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("number", "number"),
            FieldInfo::new("version", "version").version(),
            FieldInfo::new("customer", "customer_id")
                .nullable(true)
                .foreign_key("customers.id"),
        ];
        FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        const ASSOCIATIONS: &[AssociationInfo] = &[
            AssociationInfo::many_to_one::<Customer>("customer", "customer_id"),
            AssociationInfo::many_to_many::<Product>(
                "products",
                LinkTableInfo::new("order_lines", "order_id", "product_id"),
            )
            .cascade(Cascade::PERSIST_MERGE),
        ];
        ASSOCIATIONS
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![
            ("id", self.id.into()),
            ("number", self.number.clone().into()),
            ("version", self.version.into()),
            ("customer_id", self.customer.fk_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            number: row.get_named("number")?,
            version: row.get_named("version")?,
            customer: Association::from_fk(row.get_by_name("customer_id").cloned()),
            products: Collection::uninitialized(),
        })
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn association_slots(&self) -> Vec<&dyn AssociationSlot> {
        vec![&self.customer]
    }

    fn association_slots_mut(&mut self) -> Vec<&mut dyn AssociationSlot> {
        vec![&mut self.customer]
    }

    fn collection_slots(&self) -> Vec<&dyn CollectionSlot> {
        vec![&self.products]
    }

    fn collection_slots_mut(&mut self) -> Vec<&mut dyn CollectionSlot> {
        vec![&mut self.products]
    }
}

pub fn customer(id: i64, name: &str) -> EntityRef<Customer> {
    EntityRef::new(Customer {
        id: Some(id),
        name: name.to_string(),
    })
}

pub fn product(sku: &str) -> EntityRef<Product> {
    EntityRef::new(Product {
        id: None,
        sku: sku.to_string(),
    })
}

pub fn order(id: i64, number: &str, customer: &EntityRef<Customer>) -> EntityRef<Order> {
    EntityRef::new(Order {
        id: Some(id),
        number: number.to_string(),
        version: 0,
        customer: Association::resolved(customer),
        products: Collection::new(),
    })
}

pub fn customer_row(id: i64, name: &str) -> Row {
    Row::from_pairs([("id", Value::BigInt(id)), ("name", Value::from(name))])
}

pub fn order_row(id: i64, number: &str, version: i64, customer_id: i64) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("number", Value::from(number)),
        ("version", Value::BigInt(version)),
        ("customer_id", Value::BigInt(customer_id)),
    ])
}

/// Keys come from the database.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pub id: Option<i64>,
    pub city: String,
}

impl Entity for Warehouse {
    const ENTITY_NAME: &'static str = "Warehouse";
    const TABLE_NAME: &'static str = "warehouses";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("city", "city"),
        ];
        FIELDS
    }

    fn id_strategy() -> IdStrategy {
        IdStrategy::Identity
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![("id", self.id.into()), ("city", self.city.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            city: row.get_named("city")?,
        })
    }
}

/// Persisting a shipment cascades to its warehouse.
#[derive(Debug, Clone)]
pub struct Shipment {
    pub id: Option<i64>,
    pub label: String,
    pub warehouse: Association<Warehouse>,
}

impl Entity for Shipment {
    const ENTITY_NAME: &'static str = "Shipment";
    const TABLE_NAME: &'static str = "shipments";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("label", "label"),
            FieldInfo::new("warehouse", "warehouse_id")
                .nullable(true)
                .foreign_key("warehouses.id"),
        ];
        FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        const ASSOCIATIONS: &[AssociationInfo] =
            &[AssociationInfo::many_to_one::<Warehouse>("warehouse", "warehouse_id")
                .cascade(Cascade::PERSIST_MERGE)];
        ASSOCIATIONS
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![
            ("id", self.id.into()),
            ("label", self.label.clone().into()),
            ("warehouse_id", self.warehouse.fk_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            label: row.get_named("label")?,
            warehouse: Association::from_fk(row.get_by_name("warehouse_id").cloned()),
        })
    }

    fn association_slots(&self) -> Vec<&dyn AssociationSlot> {
        vec![&self.warehouse]
    }

    fn association_slots_mut(&mut self) -> Vec<&mut dyn AssociationSlot> {
        vec![&mut self.warehouse]
    }
}

pub fn warehouse(city: &str) -> EntityRef<Warehouse> {
    EntityRef::new(Warehouse {
        id: None,
        city: city.to_string(),
    })
}

pub fn shipment(id: i64, label: &str, warehouse: &EntityRef<Warehouse>) -> EntityRef<Shipment> {
    EntityRef::new(Shipment {
        id: Some(id),
        label: label.to_string(),
        warehouse: Association::resolved(warehouse),
    })
}

// ============================================================================
// Scripted connection
// ============================================================================

#[derive(Debug, Default)]
struct Script {
    /// Every call in order: queries as `query: ..`, control as the keyword.
    log: Vec<String>,
    writes: Vec<(String, Vec<Value>)>,
    batches: Vec<usize>,
    rows: Vec<(String, Vec<Row>)>,
    affected: Vec<(String, u64)>,
    fail_write: Option<usize>,
    next_key: i64,
}

impl Script {
    fn write(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.log.push(sql.to_string());
        self.writes.push((sql.to_string(), params.to_vec()));
        if self.fail_write == Some(self.writes.len()) {
            return Err(Error::Custom(format!("constraint violated by: {sql}")));
        }
        Ok(self
            .affected
            .iter()
            .rev()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or(1, |(_, n)| *n))
    }
}

/// A connection that answers from scripted rows and records everything.
///
/// Generated keys start at 100.
#[derive(Debug, Clone)]
pub struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
}

impl Default for ScriptedConnection {
    fn default() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                next_key: 100,
                ..Script::default()
            })),
        }
    }
}

impl ScriptedConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries containing `pattern`; later scripts take precedence.
    pub fn rows(&self, pattern: &str, rows: Vec<Row>) {
        self.script.lock().unwrap().rows.push((pattern.to_string(), rows));
    }

    pub fn affected(&self, pattern: &str, n: u64) {
        self.script.lock().unwrap().affected.push((pattern.to_string(), n));
    }

    /// Fail the `n`th write (1-based).
    pub fn fail_write(&self, n: usize) {
        self.script.lock().unwrap().fail_write = Some(n);
    }

    pub fn log(&self) -> Vec<String> {
        self.script.lock().unwrap().log.clone()
    }

    pub fn writes(&self) -> Vec<(String, Vec<Value>)> {
        self.script.lock().unwrap().writes.clone()
    }

    pub fn write_sql(&self) -> Vec<String> {
        self.writes().into_iter().map(|(sql, _)| sql).collect()
    }

    pub fn batches(&self) -> Vec<usize> {
        self.script.lock().unwrap().batches.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("query: ").map(str::to_string))
            .collect()
    }

    pub fn control(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| matches!(entry.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK"))
            .collect()
    }
}

fn ready<T: Send>(result: Result<T>) -> impl Future<Output = Outcome<T, Error>> + Send {
    async move {
        match result {
            Ok(v) => Outcome::Ok(v),
            Err(e) => Outcome::Err(e),
        }
    }
}

impl Connection for ScriptedConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        _params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let mut script = self.script.lock().unwrap();
        script.log.push(format!("query: {sql}"));
        let rows = script
            .rows
            .iter()
            .rev()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        ready(Ok(rows))
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        ready(self.script.lock().unwrap().write(sql, params))
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let mut script = self.script.lock().unwrap();
        let result = script.write(sql, params).map(|_| {
            let key = script.next_key;
            script.next_key += 1;
            key
        });
        ready(result)
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let mut script = self.script.lock().unwrap();
        script.batches.push(statements.len());
        let result = statements
            .iter()
            .map(|(sql, params)| script.write(sql, params))
            .collect::<Result<Vec<u64>>>();
        ready(result)
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.script.lock().unwrap().log.push("BEGIN".to_string());
        ready(Ok(()))
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.script.lock().unwrap().log.push("COMMIT".to_string());
        ready(Ok(()))
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.script.lock().unwrap().log.push("ROLLBACK".to_string());
        ready(Ok(()))
    }

    fn close(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        ready(Ok(()))
    }
}
