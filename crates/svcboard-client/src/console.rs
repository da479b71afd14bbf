use std::sync::Arc;

use svcboard_core::{ListingId, ListingSummary, SessionStatus};
use tracing::info;

use crate::{ApiClient, AuthGate, AuthState, ClientError, ViewScope};

/// Admin area: the API client with an [`AuthGate`] kept in step with every call.
#[derive(Debug)]
pub struct AdminConsole {
    client: ApiClient,
    gate: AuthGate,
    scope: Arc<ViewScope>,
    listings: Vec<ListingSummary>,
}

impl AdminConsole {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            gate: AuthGate::new(),
            scope: Arc::new(ViewScope::new()),
            listings: Vec::new(),
        }
    }

    pub fn gate(&self) -> &AuthGate {
        &self.gate
    }

    pub fn listings(&self) -> &[ListingSummary] {
        &self.listings
    }

    /// Shared handle so whoever owns navigation can mark the view as left.
    pub fn scope(&self) -> Arc<ViewScope> {
        self.scope.clone()
    }

    /// Enter the protected view: check the session, then load listings when allowed.
    ///
    /// `Ok(None)` means the view was left before the answers arrived; nothing past the
    /// initial `Checking` state is applied then. A failed listing load is returned and
    /// also kept in [`AuthGate::last_error`].
    pub async fn enter(&mut self) -> Result<Option<AuthState>, ClientError> {
        let ticket = self.scope.enter();
        self.gate.begin_check();

        let check = self.client.check_session().await;
        let Some(check) = self.scope.accept(ticket, check) else {
            return Ok(None);
        };
        let authenticated = matches!(
            check,
            Ok(SessionStatus {
                authenticated: true,
                user: Some(_),
            })
        );
        if !authenticated {
            self.gate.check_completed(check.as_ref());
            self.listings.clear();
            return Ok(Some(self.gate.state().clone()));
        }

        let loaded = self.client.list_listings().await;
        let Some(loaded) = self.scope.accept(ticket, loaded) else {
            return Ok(None);
        };
        self.gate.check_completed(check.as_ref());
        match loaded {
            Ok(listings) => {
                self.gate.clear_error();
                self.listings = listings;
                Ok(Some(self.gate.state().clone()))
            }
            Err(err) => {
                self.gate.request_failed(&err);
                self.listings.clear();
                Err(err)
            }
        }
    }

    pub fn leave(&self) {
        self.scope.leave();
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), ClientError> {
        match self.client.login(username, password).await {
            Ok(user) => {
                info!(username = %user.username, "admin session opened");
                self.gate.login_succeeded(&user);
                Ok(())
            }
            Err(err) => {
                self.gate.login_failed(&err);
                Err(err)
            }
        }
    }

    /// The gate leaves the authenticated state even when the server call fails.
    pub async fn logout(&mut self) -> Result<(), ClientError> {
        let result = self.client.logout().await;
        self.gate.logged_out();
        self.listings.clear();
        result
    }

    pub async fn refresh(&mut self) -> Result<&[ListingSummary], ClientError> {
        if !self.gate.can_render_protected() {
            return Err(ClientError::Authorization);
        }
        match self.client.list_listings().await {
            Ok(listings) => {
                self.gate.clear_error();
                self.listings = listings;
                Ok(&self.listings)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Deleting requires an authenticated gate. A server-side 401 ends the session locally.
    pub async fn delete(&mut self, id: ListingId) -> Result<(), ClientError> {
        if !self.gate.can_render_protected() {
            return Err(ClientError::Authorization);
        }
        match self.client.delete_listing(id).await {
            Ok(()) => {
                self.listings.retain(|listing| listing.id != id);
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn fail(&mut self, err: &ClientError) {
        self.gate.request_failed(err);
        if err.requires_login() {
            self.listings.clear();
        }
    }
}
