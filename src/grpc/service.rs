//! Admission service implementation.

use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::floodgate::v1::{
    admission_service_server::AdmissionService,
    check_request::Target,
    check_response::{Code, Reason as ProtoReason},
    update_list_request::{Action, List},
    Algorithm as ProtoAlgorithm, CheckRequest, CheckResponse, GetRulesRequest, Header,
    LimitType as ProtoLimitType, Policy, Quota, RuleSet, SetEnabledRequest, UpdateListRequest,
};

use crate::error::FloodgateError;
use crate::ratelimit::{
    resolve_client_ip, AdmissionDecision, AdmissionEngine, ClientAddress, LimitType, Outcome,
    RateLimitPolicy, Reason, RuleSnapshot, ScopeKey, UserId,
};

/// Implementation of the `floodgate.v1.AdmissionService` gRPC interface.
pub struct AdmissionServiceImpl {
    /// The admission engine shared by all requests
    engine: Arc<AdmissionEngine>,
}

impl AdmissionServiceImpl {
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        Self { engine }
    }

    fn rule_set(&self) -> RuleSet {
        rule_set_from(self.engine.rules().snapshot())
    }
}

impl From<FloodgateError> for Status {
    fn from(err: FloodgateError) -> Self {
        match err {
            FloodgateError::InvalidPolicy { .. } | FloodgateError::Config(_) => {
                Status::invalid_argument(err.to_string())
            }
            FloodgateError::UnknownOperation(_) => Status::not_found(err.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn client_address(req: &CheckRequest) -> ClientAddress {
    ClientAddress {
        forwarded_for: non_empty(&req.forwarded_for),
        real_ip: non_empty(&req.real_ip),
        remote_addr: non_empty(&req.remote_addr),
    }
}

/// Build an engine policy from an inline request policy.
fn policy_from_proto(policy: &Policy) -> Result<RateLimitPolicy, Status> {
    let limit_type = match policy.limit_type() {
        ProtoLimitType::Global => LimitType::Global,
        ProtoLimitType::User => LimitType::User,
        ProtoLimitType::Ip => LimitType::Ip,
        ProtoLimitType::Unspecified => {
            return Err(Status::invalid_argument("policy.limit_type is required"))
        }
    };

    let policy = match policy.algorithm() {
        ProtoAlgorithm::SlidingWindow => RateLimitPolicy::sliding_window(
            policy.scope_key_name.clone(),
            limit_type,
            policy.max_requests,
            Duration::from_millis(policy.window_ms),
        ),
        ProtoAlgorithm::TokenBucket => RateLimitPolicy::token_bucket(
            policy.scope_key_name.clone(),
            limit_type,
            policy.capacity,
            policy.refill_tokens,
            Duration::from_millis(policy.refill_interval_ms),
        ),
        ProtoAlgorithm::Unspecified => {
            return Err(Status::invalid_argument("policy.algorithm is required"))
        }
    };

    policy.validate()?;
    Ok(policy)
}

fn response_from(decision: &AdmissionDecision, scope_key: Option<&ScopeKey>) -> CheckResponse {
    let code = match decision.outcome {
        Outcome::Allowed => Code::Ok,
        Outcome::QuotaExceeded => Code::OverLimit,
        Outcome::Forbidden => Code::Forbidden,
    };
    let reason = match decision.reason {
        Reason::Evaluated => ProtoReason::Evaluated,
        Reason::Disabled => ProtoReason::Disabled,
        Reason::Whitelisted => ProtoReason::Whitelisted,
        Reason::StoreUnavailable => ProtoReason::StoreUnavailable,
        Reason::Blacklisted => ProtoReason::Blacklisted,
    };

    CheckResponse {
        code: code.into(),
        reason: reason.into(),
        quota: decision.quota.map(|quota| Quota {
            limit: quota.limit,
            remaining: quota.remaining,
            reset_seconds: quota.reset_seconds,
        }),
        headers: decision
            .headers()
            .into_iter()
            .map(|(name, value)| Header {
                name: name.to_string(),
                value,
            })
            .collect(),
        scope_key: match (decision.quota, scope_key) {
            (Some(_), Some(key)) => key.to_string(),
            _ => String::new(),
        },
    }
}

fn rule_set_from(snapshot: RuleSnapshot) -> RuleSet {
    RuleSet {
        enabled: snapshot.enabled,
        user_whitelist: snapshot.user_whitelist.into_iter().collect(),
        ip_whitelist: snapshot.ip_whitelist.into_iter().collect(),
        ip_blacklist: snapshot.ip_blacklist.into_iter().collect(),
    }
}

#[tonic::async_trait]
impl AdmissionService for AdmissionServiceImpl {
    /// Decide whether one protected operation may proceed.
    #[instrument(
        skip(self, request),
        fields(user_id = ?request.get_ref().user_id)
    )]
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> Result<Response<CheckResponse>, Status> {
        let req = request.into_inner();

        let policy = match &req.target {
            Some(Target::Operation(operation)) => {
                if operation.trim().is_empty() {
                    warn!("Received check request with empty operation");
                    return Err(Status::invalid_argument("operation must not be empty"));
                }
                self.engine
                    .policy(operation)
                    .ok_or_else(|| FloodgateError::UnknownOperation(operation.clone()))?
            }
            Some(Target::Policy(policy)) => policy_from_proto(policy)?,
            None => {
                warn!("Received check request without operation or policy");
                return Err(Status::invalid_argument("operation or policy is required"));
            }
        };

        let user_id: Option<UserId> = req.user_id;
        let address = client_address(&req);

        debug!(
            scope = %policy.scope_key_name,
            address = ?address,
            "Processing admission check"
        );

        let decision = self.engine.check(&policy, user_id, &address).await;
        let scope_key = ScopeKey::build(&policy, user_id, &resolve_client_ip(&address));

        debug!(
            key = %scope_key,
            outcome = ?decision.outcome,
            reason = ?decision.reason,
            "Admission decision made"
        );

        Ok(Response::new(response_from(&decision, Some(&scope_key))))
    }

    #[instrument(skip(self, _request))]
    async fn get_rules(
        &self,
        _request: Request<GetRulesRequest>,
    ) -> Result<Response<RuleSet>, Status> {
        Ok(Response::new(self.rule_set()))
    }

    #[instrument(skip(self, request), fields(enabled = request.get_ref().enabled))]
    async fn set_enabled(
        &self,
        request: Request<SetEnabledRequest>,
    ) -> Result<Response<RuleSet>, Status> {
        let enabled = request.into_inner().enabled;
        self.engine.rules().set_enabled(enabled);
        info!(enabled, "Rate limiting switch updated over gRPC");
        Ok(Response::new(self.rule_set()))
    }

    #[instrument(skip(self, request))]
    async fn update_list(
        &self,
        request: Request<UpdateListRequest>,
    ) -> Result<Response<RuleSet>, Status> {
        let req = request.into_inner();
        let list = req.list();
        let action = req.action();
        let value = req.value.trim();

        if action == Action::Unspecified {
            return Err(Status::invalid_argument("action is required"));
        }
        if value.is_empty() {
            return Err(Status::invalid_argument("value must not be empty"));
        }

        let rules = self.engine.rules();
        match list {
            List::UserWhitelist => {
                let user_id: UserId = value.parse().map_err(|_| {
                    Status::invalid_argument(format!("'{}' is not a valid user id", value))
                })?;
                match action {
                    Action::Add => rules.add_user_whitelist(user_id),
                    _ => rules.remove_user_whitelist(user_id),
                }
            }
            List::IpWhitelist => match action {
                Action::Add => rules.add_ip_whitelist(value),
                _ => rules.remove_ip_whitelist(value),
            },
            List::IpBlacklist => match action {
                Action::Add => rules.add_ip_blacklist(value),
                _ => rules.remove_ip_blacklist(value),
            },
            List::Unspecified => {
                return Err(Status::invalid_argument("list is required"));
            }
        }

        Ok(Response::new(self.rule_set()))
    }
}
