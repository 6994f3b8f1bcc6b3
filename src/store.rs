//! Transactional record store over sled. A work order, its business record
//! and its exchange log always change together inside one multi-tree
//! transaction, together with the secondary index entries that point at them.
use std::path::Path;
use std::sync::Arc;

use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};

use crate::error::StoreError;
use crate::model::{BusinessRecord, OrderBundle, RawExchangeLog, UserRecord, WorkOrder};

type TxResult<T, E = StoreError> = Result<T, ConflictableTransactionError<E>>;

/// Steps of writing a new bundle, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleStep {
    Order,
    Exchange,
    Business,
    Index,
}

pub struct WorkOrderStore {
    instance: Arc<sled::Db>,
    orders: sled::Tree,
    business: sled::Tree,
    exchanges: sled::Tree,
    index: sled::Tree,
    users: sled::Tree,
}

impl WorkOrderStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, StoreError> {
        Ok(Self {
            orders: instance.open_tree("orders")?,
            business: instance.open_tree("business")?,
            exchanges: instance.open_tree("exchanges")?,
            index: instance.open_tree("index")?,
            users: instance.open_tree("users")?,
            instance,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn db(&self) -> Arc<sled::Db> {
        self.instance.clone()
    }

    /// Monotonic sequence used for task numbers
    pub fn next_sequence(&self) -> Result<u64, StoreError> {
        Ok(self.instance.generate_id()?)
    }

    pub fn put_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.users.insert(user.id.as_bytes(), encode(user)?)?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        self.users
            .get(user_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn get_order(&self, id: &str) -> Result<Option<WorkOrder>, StoreError> {
        self.orders
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn get_business(&self, id: &str) -> Result<Option<BusinessRecord>, StoreError> {
        self.business
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn get_exchange(&self, id: &str) -> Result<Option<RawExchangeLog>, StoreError> {
        self.exchanges
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn get_bundle(&self, id: &str) -> Result<Option<OrderBundle>, StoreError> {
        let Some(order) = self.get_order(id)? else {
            return Ok(None);
        };
        Ok(Some(OrderBundle {
            business: self.get_business(id)?,
            exchange: self.get_exchange(id)?,
            order,
        }))
    }

    pub fn find_by_task_id(&self, task_id: &str) -> Result<Option<WorkOrder>, StoreError> {
        self.resolve(&task_key(task_id))
    }

    pub fn find_by_task_number(&self, task_number: &str) -> Result<Option<WorkOrder>, StoreError> {
        self.resolve(&number_key(task_number))
    }

    /// Non-deleted order currently bound to a third-party task id
    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<WorkOrder>, StoreError> {
        self.resolve(&ext_key(external_id))
    }

    fn resolve(&self, index_key: &str) -> Result<Option<WorkOrder>, StoreError> {
        match self.index.get(index_key.as_bytes())? {
            Some(id) => {
                let id = String::from_utf8_lossy(&id).into_owned();
                self.get_order(&id)
            }
            None => Ok(None),
        }
    }

    /// All orders owned by `user_id`, newest first, deleted ones included
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<WorkOrder>, StoreError> {
        let prefix = format!("user/{user_id}/");
        let mut orders = Vec::new();
        for entry in self.index.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let key = String::from_utf8_lossy(&key);
            let Some(order_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            if let Some(order) = self.get_order(order_id)? {
                orders.push(order);
            }
        }
        orders.sort_by_key(|o| std::cmp::Reverse(o.created_at.nanos()));
        Ok(orders)
    }

    pub fn count_orders(&self) -> usize {
        self.orders.len()
    }

    pub fn count_business(&self) -> usize {
        self.business.len()
    }

    /// Write a new work order with its business record, exchange log and
    /// index entries in one transaction. Task number, task id, order id and
    /// third-party task id must all be unused.
    pub fn insert_bundle(&self, bundle: &OrderBundle) -> Result<(), StoreError> {
        self.insert_bundle_with(bundle, &|_| Ok(()))
    }

    fn insert_bundle_with(
        &self,
        bundle: &OrderBundle,
        checkpoint: &dyn Fn(BundleStep) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let result = (&self.orders, &self.business, &self.exchanges, &self.index).transaction(
            |(orders, business, exchanges, index)| -> TxResult<()> {
                let order = &bundle.order;
                if orders.get(order.id.as_bytes())?.is_some() {
                    return abort_with(StoreError::Conflict(format!("work order {}", order.id)));
                }
                for key in [task_key(&order.task_id), number_key(&order.task_number)] {
                    if index.get(key.as_bytes())?.is_some() {
                        return abort_with(StoreError::Conflict(key));
                    }
                }
                if let Some(ext) = bound_external_id(order) {
                    if index.get(ext_key(ext).as_bytes())?.is_some() {
                        return abort_with(StoreError::Conflict(format!(
                            "external task id {ext} is already bound"
                        )));
                    }
                }

                tx_put(orders, &order.id, order)?;
                checkpoint(BundleStep::Order).map_err(ConflictableTransactionError::Abort)?;

                if let Some(exchange) = &bundle.exchange {
                    tx_put(exchanges, &order.id, exchange)?;
                }
                checkpoint(BundleStep::Exchange).map_err(ConflictableTransactionError::Abort)?;

                if let Some(record) = &bundle.business {
                    if business.get(order.id.as_bytes())?.is_none() {
                        tx_put(business, &order.id, record)?;
                    }
                }
                checkpoint(BundleStep::Business).map_err(ConflictableTransactionError::Abort)?;

                write_index(index, order)?;
                checkpoint(BundleStep::Index).map_err(ConflictableTransactionError::Abort)?;
                Ok(())
            },
        );
        settle(result)
    }

    /// Create the business record for `order_id` unless one exists. Returns
    /// whether a record was written.
    pub fn insert_business_if_absent(
        &self,
        order_id: &str,
        record: &BusinessRecord,
    ) -> Result<bool, StoreError> {
        let result = (&self.orders, &self.business).transaction(
            |(orders, business)| -> TxResult<bool> {
                if orders.get(order_id.as_bytes())?.is_none() {
                    return abort_with(StoreError::NotFound(format!("work order {order_id}")));
                }
                if business.get(order_id.as_bytes())?.is_some() {
                    return Ok(false);
                }
                tx_put(business, order_id, record)?;
                Ok(true)
            },
        );
        settle(result)
    }

    /// Read-modify-write of one bundle. `f` sees the committed state and may
    /// run more than once if another writer touches the same records, so the
    /// status gate inside it acts as a compare-and-swap.
    pub fn update_bundle<E, F>(&self, id: &str, f: F) -> Result<OrderBundle, E>
    where
        E: From<StoreError>,
        F: Fn(&mut OrderBundle) -> Result<(), E>,
    {
        let result = (&self.orders, &self.business, &self.exchanges, &self.index).transaction(
            |(orders, business, exchanges, index)| -> TxResult<OrderBundle, E> {
                let Some(order) = tx_get::<WorkOrder, E>(orders, id)? else {
                    return abort_with(StoreError::NotFound(format!("work order {id}")));
                };
                let before = order.clone();
                let mut bundle = OrderBundle {
                    business: tx_get(business, id)?,
                    exchange: tx_get(exchanges, id)?,
                    order,
                };
                f(&mut bundle).map_err(ConflictableTransactionError::Abort)?;

                let after = &bundle.order;
                let old_ext = bound_external_id(&before);
                let new_ext = bound_external_id(after);
                if old_ext != new_ext {
                    if let Some(old) = old_ext {
                        index.remove(ext_key(old).as_bytes())?;
                    }
                    if let Some(new) = new_ext {
                        let key = ext_key(new);
                        if let Some(owner) = index.get(key.as_bytes())? {
                            if &*owner != after.id.as_bytes() {
                                return abort_with(StoreError::Conflict(format!(
                                    "external task id {new} is already bound"
                                )));
                            }
                        }
                        index.insert(key.as_bytes(), after.id.as_bytes())?;
                    }
                }

                tx_put(orders, id, after)?;
                if let Some(record) = &bundle.business {
                    tx_put(business, id, record)?;
                }
                if let Some(exchange) = &bundle.exchange {
                    tx_put(exchanges, id, exchange)?;
                }
                Ok(bundle)
            },
        );
        settle(result)
    }
}

fn task_key(task_id: &str) -> String {
    format!("task/{task_id}")
}

fn number_key(task_number: &str) -> String {
    format!("number/{task_number}")
}

fn ext_key(external_id: &str) -> String {
    format!("ext/{external_id}")
}

fn user_key(user_id: &str, order_id: &str) -> String {
    format!("user/{user_id}/{order_id}")
}

// deleted orders release their external id
fn bound_external_id(order: &WorkOrder) -> Option<&str> {
    if order.is_deleted {
        None
    } else {
        order.third_party_task_id.as_deref()
    }
}

fn write_index(index: &TransactionalTree, order: &WorkOrder) -> TxResult<()> {
    let id = order.id.as_bytes();
    index.insert(task_key(&order.task_id).as_bytes(), id)?;
    index.insert(number_key(&order.task_number).as_bytes(), id)?;
    index.insert(user_key(&order.user_id, &order.id).as_bytes(), id)?;
    if let Some(ext) = bound_external_id(order) {
        index.insert(ext_key(ext).as_bytes(), id)?;
    }
    Ok(())
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T>(bytes: &[u8]) -> Result<T, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

fn abort_with<T, E: From<StoreError>>(err: StoreError) -> TxResult<T, E> {
    Err(ConflictableTransactionError::Abort(E::from(err)))
}

fn tx_get<T, E>(tree: &TransactionalTree, key: &str) -> TxResult<Option<T>, E>
where
    T: for<'b> minicbor::Decode<'b, ()>,
    E: From<StoreError>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => match decode(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => abort_with(err),
        },
        None => Ok(None),
    }
}

fn tx_put<T, E>(tree: &TransactionalTree, key: &str, value: &T) -> TxResult<(), E>
where
    T: minicbor::Encode<()>,
    E: From<StoreError>,
{
    let bytes = match encode(value) {
        Ok(bytes) => bytes,
        Err(err) => return abort_with(err),
    };
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

fn settle<T, E: From<StoreError>>(result: Result<T, TransactionError<E>>) -> Result<T, E> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => E::from(StoreError::Sled(err)),
    })
}
