//! Fleetdesk
//!
//! Customer pipeline and device inventory engine for a device-fleet business,
//! backed by a PostgREST data API. Customers move through POC approval,
//! extension, expiry and onboarding; devices move between the stock registry
//! and the inward/outward ledgers.

pub mod cache;
pub mod config;
pub mod customers;
pub mod error;
pub mod fetch;
pub mod inventory;
pub mod leads;
pub mod notify;
pub mod postgrest;
pub mod realtime;
pub mod scheduler;

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::TableCache;
use crate::config::{Credentials, DeskOptions};
use crate::customers::CustomerService;
use crate::error::Error;
use crate::inventory::Inventory;
use crate::leads::LeadService;
use crate::notify::{LogMailer, Mailer, Notifier};
use crate::postgrest::{tables, Gateway, MemoryGateway, RestGateway, TableQuery};
use crate::realtime::{websocket_url, ChangeFeed, ChangeListener, Channel, ChannelBuilder};
use crate::scheduler::Scheduler;

/// Operator answer to a destructive action prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Declined,
}

/// The main entry point: services sharing one gateway and change feed
pub struct FleetDesk {
    gateway: Arc<dyn Gateway>,
    feed: ChangeFeed,
    options: DeskOptions,
    notifier: Arc<Notifier>,
    customers: Arc<CustomerService>,
    leads: Arc<LeadService>,
    inventory: Arc<Inventory>,
    realtime_url: Option<String>,
}

impl FleetDesk {
    /// Create a new FleetDesk talking to a PostgREST backend
    ///
    /// # Example
    ///
    /// ```
    /// use fleetdesk::FleetDesk;
    ///
    /// let desk = FleetDesk::new("https://your-project-url.supabase.co", "your-api-key");
    /// let query = desk.from("stock");
    /// ```
    pub fn new(url: &str, key: &str) -> Self {
        let credentials = Credentials {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        };
        Self::new_with_options(&credentials, DeskOptions::default())
    }

    /// Create a new FleetDesk with custom options
    pub fn new_with_options(credentials: &Credentials, options: DeskOptions) -> Self {
        let gateway = Arc::new(RestGateway::new(credentials, &options));
        let feed = ChangeFeed::new(options.change_feed_capacity);
        Self::with_gateway(gateway, feed, options, Arc::new(LogMailer))
            .with_realtime_url(&websocket_url(&credentials.url, &credentials.key))
    }

    /// Set the realtime socket that [`FleetDesk::listener`] connects to
    pub fn with_realtime_url(mut self, url: &str) -> Self {
        self.realtime_url = Some(url.to_string());
        self
    }

    /// Create a FleetDesk from `FLEETDESK_URL` / `FLEETDESK_KEY`
    pub fn from_env() -> Result<Self, Error> {
        let credentials = Credentials::from_env()?;
        Ok(Self::new_with_options(&credentials, DeskOptions::default()))
    }

    /// Assemble the services over any gateway
    ///
    /// Changes must reach `feed` for watched caches to refresh; the memory
    /// gateway publishes them itself, a REST deployment forwards realtime
    /// payloads with [`ChangeFeed::publish_payload`].
    pub fn with_gateway(
        gateway: Arc<dyn Gateway>,
        feed: ChangeFeed,
        options: DeskOptions,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(gateway.clone(), mailer));
        let customer_cache = Arc::new(TableCache::new(
            gateway.clone(),
            tables::CUSTOMERS,
            "created_at",
        ));
        let lead_cache = Arc::new(TableCache::new(gateway.clone(), tables::LEADS, "created_at"));

        let customers = Arc::new(CustomerService::new(
            gateway.clone(),
            customer_cache.clone(),
            notifier.clone(),
            options.clone(),
        ));
        let leads = Arc::new(LeadService::new(
            gateway.clone(),
            lead_cache,
            customer_cache.clone(),
            options.clone(),
        ));
        let inventory = Arc::new(Inventory::new(
            gateway.clone(),
            customer_cache,
            options.clone(),
        ));

        Self {
            gateway,
            feed,
            options,
            notifier,
            customers,
            leads,
            inventory,
            realtime_url: None,
        }
    }

    /// An offline FleetDesk over an in-memory gateway
    ///
    /// # Example
    ///
    /// ```
    /// use fleetdesk::{config::DeskOptions, FleetDesk};
    ///
    /// let (desk, _gateway) = FleetDesk::in_memory(DeskOptions::default());
    /// assert!(desk.customers().pending().is_empty());
    /// ```
    pub fn in_memory(options: DeskOptions) -> (Self, Arc<MemoryGateway>) {
        Self::in_memory_with_mailer(options, Arc::new(LogMailer))
    }

    pub fn in_memory_with_mailer(
        options: DeskOptions,
        mailer: Arc<dyn Mailer>,
    ) -> (Self, Arc<MemoryGateway>) {
        let feed = ChangeFeed::new(options.change_feed_capacity);
        let gateway = Arc::new(MemoryGateway::with_feed(feed.clone()));
        let desk = Self::with_gateway(gateway.clone(), feed, options, mailer);
        (desk, gateway)
    }

    /// Query a table directly
    pub fn from(&self, table: &str) -> TableQuery {
        TableQuery::new(self.gateway.clone(), table)
    }

    pub fn customers(&self) -> &Arc<CustomerService> {
        &self.customers
    }

    pub fn leads(&self) -> &Arc<LeadService> {
        &self.leads
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn options(&self) -> &DeskOptions {
        &self.options
    }

    /// Load every cached table
    pub async fn load(&self) -> Result<(), Error> {
        self.customers.reload().await?;
        self.leads.reload().await?;
        self.inventory.reload().await?;
        log::info!(
            "Loaded {} customers, {} leads, {} stock devices",
            self.customers.cache().len(),
            self.leads.cache().len(),
            self.inventory.stock_cache().len()
        );
        Ok(())
    }

    /// Keep every cache in step with the change feed
    pub fn watch(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.customers.cache().watch(&self.feed),
            self.leads.cache().watch(&self.feed),
            self.inventory.stock_cache().watch(&self.feed),
            self.inventory.inward_cache().watch(&self.feed),
            self.inventory.outward_cache().watch(&self.feed),
        ]
    }

    /// Realtime channel covering every watched table
    pub fn channel(&self) -> Channel {
        ChannelBuilder::new(&self.options.db_schema)
            .table(tables::CUSTOMERS)
            .table(tables::LEADS)
            .table(tables::STOCK)
            .table(tables::INWARD_DEVICES)
            .table(tables::OUTWARD_DEVICES)
            .build()
    }

    /// Listener forwarding backend changes of the watched tables into the feed
    ///
    /// `None` without a realtime socket, as with the in-memory gateway, which
    /// publishes its own changes.
    pub fn listener(&self) -> Option<ChangeListener> {
        self.realtime_url
            .as_deref()
            .map(|url| ChangeListener::new(url, self.channel(), self.feed.clone(), &self.options))
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.customers.clone(),
            self.inventory.clone(),
            self.notifier.clone(),
            self.options.clone(),
        )
    }
}

/// A convenience module for common imports
pub mod prelude {
    pub use crate::config::{Credentials, DeskOptions};
    pub use crate::customers::{Customer, NewCustomer, PocType};
    pub use crate::error::Error;
    pub use crate::inventory::{Assignment, DeviceCondition, DeviceStatus, NewStockDevice};
    pub use crate::leads::{LeadType, NewLead};
    pub use crate::{Confirmation, FleetDesk};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_covers_dashboard_tables() {
        let (desk, _) = FleetDesk::in_memory(DeskOptions::default());
        assert_eq!(
            desk.channel().topic,
            "realtime:public:customers,leads,stock,inward_devices,outward_devices"
        );
    }

    #[test]
    fn test_listener_needs_a_realtime_socket() {
        let (desk, _) = FleetDesk::in_memory(DeskOptions::default());
        assert!(desk.listener().is_none());

        let desk = FleetDesk::new("https://fleet.example.com", "k");
        let listener = desk.listener().unwrap();
        assert_eq!(listener.channel().topic, desk.channel().topic);
    }
}
