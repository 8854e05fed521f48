use std::sync::Arc;

use tracing::{error, info, warn};

use gatehouse_protocol::{GenericMessage, LoginMessage, OperationResult, RegisterMessage};

use crate::models::AccountPolicy;
use crate::service::{AccountService, Registration};

/// Request handlers for the account protocol. Each one turns a decoded
/// message into the result sent back to the client.
#[derive(Clone)]
pub struct AccountHandlers {
    service: Arc<AccountService>,
    policy: AccountPolicy,
}

impl AccountHandlers {
    pub fn new(service: Arc<AccountService>, policy: AccountPolicy) -> Self {
        Self { service, policy }
    }

    pub fn login(&self, msg: &LoginMessage) -> OperationResult {
        let client = &msg.meta.client_id;
        if msg.username.is_empty() || msg.password.is_empty() {
            warn!(client = %client, "Login with missing credentials");
            return OperationResult::service_error("Invalid credentials");
        }

        match self.service.verify_password(&msg.username, &msg.password) {
            Ok(Some(account)) => {
                if let Err(e) = self.service.update_last_login(account.id) {
                    warn!(username = %msg.username, "Failed to record login time: {:#}", e);
                }
                info!(client = %client, username = %msg.username, "Login successful");
                OperationResult::success("Login successful")
            }
            Ok(None) => {
                info!(client = %client, username = %msg.username, "Login rejected");
                OperationResult::service_error("Invalid credentials")
            }
            Err(e) => {
                error!(username = %msg.username, "Login failed: {:#}", e);
                OperationResult::database_error("Database error")
            }
        }
    }

    pub fn register(&self, msg: &RegisterMessage) -> OperationResult {
        if msg.username.is_empty()
            || msg.password.is_empty()
            || msg.email.is_empty()
            || msg.username.chars().count() > self.policy.username_max_length
        {
            return OperationResult::invalid_format("Invalid registration data");
        }
        if msg.password.chars().count() < self.policy.password_min_length {
            return OperationResult::invalid_format("Password too short");
        }

        match self.service.create_account(&msg.username, &msg.password, &msg.email) {
            Ok(Registration::Created(id)) => {
                info!(client = %msg.meta.client_id, username = %msg.username, id, "Registration successful");
                OperationResult::success("Registration successful")
            }
            Ok(Registration::UsernameTaken) => OperationResult::service_error("Username already exists"),
            Err(e) => {
                error!(username = %msg.username, "Registration failed: {:#}", e);
                OperationResult::database_error("Database error")
            }
        }
    }

    pub fn logout(&self, msg: &GenericMessage) -> OperationResult {
        info!(client = %msg.meta.client_id, username = %msg.payload, "Logout");
        OperationResult::success("Logout successful")
    }

    /// Look up an account by the username in the payload.
    pub fn query_data(&self, msg: &GenericMessage) -> OperationResult {
        let username = msg.payload.trim();
        if username.is_empty() {
            return OperationResult::invalid_format("Invalid request format");
        }
        match self.service.get_account(username) {
            Ok(Some(account)) => match serde_json::to_string(&account) {
                Ok(json) => OperationResult::success("Account found").with_data(json),
                Err(e) => {
                    error!(username, "Failed to encode account: {}", e);
                    OperationResult::service_error("Failed to encode account")
                }
            },
            Ok(None) => OperationResult::not_found("Account not found"),
            Err(e) => {
                error!(username, "Account query failed: {:#}", e);
                OperationResult::database_error("Database error")
            }
        }
    }

    pub fn heartbeat(&self, _msg: &GenericMessage) -> OperationResult {
        OperationResult::success("pong")
    }
}
