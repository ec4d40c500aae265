use ring::constant_time;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use warp::{
    reject::{self, Reject},
    Filter,
};

use crate::controllers::LedgerController;

#[derive(Debug)]
pub struct Unauthorized;

impl Reject for Unauthorized {}

/// Shared secret for the administrative endpoints.
#[derive(Clone, Debug)]
pub struct AdminKey(Arc<Vec<u8>>);

impl AdminKey {
    pub fn new(key: Vec<u8>) -> AdminKey {
        AdminKey(Arc::new(key))
    }

    pub fn verify(&self, token: &str) -> bool {
        if self.0.is_empty() {
            return false;
        }

        match hex::decode(token.trim()) {
            Ok(token) => constant_time::verify_slices_are_equal(&token, &self.0).is_ok(),
            Err(_err) => false,
        }
    }
}

pub fn with_ledger_controller(
    ledger_controller: LedgerController,
) -> impl Filter<Extract = (LedgerController,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || ledger_controller.clone())
}

pub fn json_body<T: DeserializeOwned + Send>(
    max_bytes: u64,
) -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(max_bytes).and(warp::body::json())
}

pub fn admin(admin_key: AdminKey) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
    warp::header::optional("Authorization")
        .and_then(move |auth: Option<String>| {
            let admin_key = admin_key.clone();
            async move {
                let auth = auth.ok_or_else(|| reject::custom(Unauthorized))?;

                let mut parts = auth.splitn(2, ' ');
                let kind = parts.next().ok_or_else(|| reject::custom(Unauthorized))?;
                let value = parts.next().ok_or_else(|| reject::custom(Unauthorized))?;

                if !kind.eq_ignore_ascii_case("bearer") || !admin_key.verify(value) {
                    return Err(reject::custom(Unauthorized));
                }

                Ok(())
            }
        })
        .untuple_one()
}
