//! Core domain model, wire types and submission validation for svcboard.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "svcboard-core";

/// Payment methods offered when no other list is configured.
pub const DEFAULT_PAYMENT_METHODS: [&str; 4] = ["Cheque", "Dinheiro", "Cartão", "Transferência"];

/// Column order of every CSV export. Stable; consumers index by position.
pub const CSV_COLUMNS: [&str; 13] = [
    "orgao_demandante",
    "titulo_servico",
    "tipo_atividade",
    "especificacao_atividade",
    "descricao_servico",
    "outras_informacoes",
    "endereco",
    "numero",
    "bairro",
    "forma_pagamento",
    "prazo_pagamento",
    "prazo_expiracao",
    "data_limite_execucao",
];

/// Lexical DD/MM/YYYY rule, shared with the browser-side form check.
pub const DATE_PATTERN: &str = r"^(0[1-9]|[12][0-9]|3[01])/(0[1-9]|1[012])/([0-9]{4})$";

static EXPIRATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(DATE_PATTERN).expect("expiration pattern compiles"));

/// Opaque listing identifier assigned by the store at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub i64);

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ListingId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Raw submission as typed into the public form. Every member is free text until
/// [`validate_submission`] turns it into [`ListingFields`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewListing {
    #[serde(rename = "orgao_demandante")]
    pub requesting_agency: String,
    #[serde(rename = "titulo_servico")]
    pub title: String,
    #[serde(rename = "tipo_atividade")]
    pub activity_type: String,
    #[serde(rename = "especificacao_atividade")]
    pub activity_specification: String,
    #[serde(rename = "descricao_servico")]
    pub description: String,
    #[serde(rename = "outras_informacoes")]
    pub additional_information: String,
    #[serde(rename = "endereco")]
    pub address: String,
    #[serde(rename = "numero")]
    pub house_number: String,
    #[serde(rename = "bairro")]
    pub neighborhood: String,
    #[serde(rename = "forma_pagamento")]
    pub payment_method: String,
    #[serde(rename = "prazo_pagamento")]
    pub payment_term: String,
    #[serde(rename = "prazo_expiracao")]
    pub expiration_deadline: String,
    #[serde(rename = "data_limite_execucao")]
    pub execution_deadline: String,
}

impl NewListing {
    /// Client-side gate run before the submission leaves the form.
    pub fn preflight(&self) -> Vec<String> {
        preflight_violations(&self.house_number, &self.expiration_deadline)
    }
}

/// Validated listing content. Only [`validate_submission`] and the stores build these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFields {
    #[serde(rename = "orgao_demandante")]
    pub requesting_agency: String,
    #[serde(rename = "titulo_servico")]
    pub title: String,
    #[serde(rename = "tipo_atividade")]
    pub activity_type: String,
    #[serde(rename = "especificacao_atividade")]
    pub activity_specification: String,
    #[serde(rename = "descricao_servico")]
    pub description: String,
    #[serde(rename = "outras_informacoes")]
    pub additional_information: Option<String>,
    #[serde(rename = "endereco")]
    pub address: String,
    #[serde(rename = "numero")]
    pub house_number: String,
    #[serde(rename = "bairro")]
    pub neighborhood: String,
    #[serde(rename = "forma_pagamento")]
    pub payment_method: String,
    #[serde(rename = "prazo_pagamento")]
    pub payment_term: String,
    #[serde(rename = "prazo_expiracao")]
    pub expiration_deadline: NaiveDate,
    #[serde(rename = "data_limite_execucao")]
    pub execution_deadline: NaiveDate,
}

impl ListingFields {
    /// One CSV row, in [`CSV_COLUMNS`] order.
    pub fn csv_record(&self) -> [String; 13] {
        [
            self.requesting_agency.clone(),
            self.title.clone(),
            self.activity_type.clone(),
            self.activity_specification.clone(),
            self.description.clone(),
            self.additional_information.clone().unwrap_or_default(),
            self.address.clone(),
            self.house_number.clone(),
            self.neighborhood.clone(),
            self.payment_method.clone(),
            self.payment_term.clone(),
            self.expiration_deadline.format("%Y-%m-%d").to_string(),
            self.execution_deadline.format("%Y-%m-%d").to_string(),
        ]
    }
}

/// A stored service opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub id: ListingId,
    #[serde(rename = "data_cadastro")]
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: ListingFields,
}

/// Row shown by the public and admin listing views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: ListingId,
    #[serde(rename = "titulo_servico")]
    pub title: String,
    #[serde(rename = "orgao_demandante")]
    pub requesting_agency: String,
    #[serde(rename = "tipo_atividade")]
    pub activity_type: String,
    #[serde(rename = "bairro")]
    pub neighborhood: String,
    #[serde(rename = "prazo_expiracao")]
    pub expiration_deadline: NaiveDate,
}

impl From<&ServiceListing> for ListingSummary {
    fn from(listing: &ServiceListing) -> Self {
        Self {
            id: listing.id,
            title: listing.fields.title.clone(),
            requesting_agency: listing.fields.requesting_agency.clone(),
            activity_type: listing.fields.activity_type.clone(),
            neighborhood: listing.fields.neighborhood.clone(),
            expiration_deadline: listing.fields.expiration_deadline,
        }
    }
}

/// Reference data needed to render and validate the submission form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormConfiguration {
    #[serde(rename = "orgaos")]
    pub agencies: Vec<String>,
    #[serde(rename = "tipoAtividade")]
    pub activity_types: Vec<String>,
    #[serde(rename = "especificacaoAtividade")]
    pub specifications: BTreeMap<String, Vec<String>>,
    #[serde(rename = "formaPagamento")]
    pub payment_methods: Vec<String>,
    pub today: NaiveDate,
}

impl FormConfiguration {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            agencies: vec![],
            activity_types: vec![],
            specifications: BTreeMap::new(),
            payment_methods: DEFAULT_PAYMENT_METHODS.iter().map(|m| m.to_string()).collect(),
            today,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn allows_specification(&self, activity_type: &str, specification: &str) -> bool {
        self.specifications
            .get(activity_type)
            .is_some_and(|allowed| allowed.iter().any(|s| s == specification))
    }
}

/// An authenticated administrator, as tracked by the server's session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSession {
    pub id: Uuid,
    pub user_id: i64,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

impl AdminSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Caller identity handed to every protected operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionContext {
    #[default]
    Anonymous,
    Admin(AdminSession),
}

impl SessionContext {
    pub fn admin(&self) -> Option<&AdminSession> {
        match self {
            Self::Admin(session) => Some(session),
            Self::Anonymous => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    pub user: UserInfo,
}

/// Body of `GET /auth/check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

impl SessionStatus {
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            user: None,
        }
    }

    pub fn for_session(session: &AdminSession) -> Self {
        Self {
            authenticated: true,
            user: Some(UserInfo {
                id: session.user_id,
                username: session.username.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedListing {
    pub message: String,
    pub id: ListingId,
}

/// Error body shared by every JSON endpoint: either a single `error` or a list of
/// field-level `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ErrorBody {
    pub fn message(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            errors: vec![],
        }
    }

    pub fn field_errors(errors: Vec<String>) -> Self {
        Self { error: None, errors }
    }
}

/// Lexical DD/MM/YYYY check. No calendar validation: `31/02/2024` passes.
pub fn is_lexical_date(input: &str) -> bool {
    EXPIRATION_PATTERN.is_match(input)
}

pub fn is_house_number(input: &str) -> bool {
    !input.is_empty() && input.chars().all(|c| c.is_ascii_digit())
}

/// Pre-flight violations for the two fields the form checks locally.
/// An empty result means the submission may be dispatched.
pub fn preflight_violations(house_number: &str, expiration_deadline: &str) -> Vec<String> {
    let mut violations = Vec::new();
    if !is_lexical_date(expiration_deadline) {
        violations.push("Expiration deadline must use the DD/MM/YYYY format.".to_string());
    }
    if !is_house_number(house_number) {
        violations.push("House number must contain only digits.".to_string());
    }
    violations
}

/// Parse a deadline in `DD/MM/YYYY` or ISO `YYYY-MM-DD` form into a real calendar date.
pub fn parse_deadline(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    if is_lexical_date(input) {
        return NaiveDate::parse_from_str(input, "%d/%m/%Y").ok();
    }
    let iso = input.as_bytes();
    if iso.len() == 10 && iso[4] == b'-' && iso[7] == b'-' {
        return NaiveDate::parse_from_str(input, "%Y-%m-%d").ok();
    }
    None
}

/// Authoritative validation applied by the lifecycle service before anything is stored.
/// Every violation is reported; nothing short-circuits.
pub fn validate_submission(
    input: &NewListing,
    config: &FormConfiguration,
) -> Result<ListingFields, Vec<String>> {
    let mut errors = Vec::new();

    let required = |value: &str, label: &str, errors: &mut Vec<String>| -> String {
        let value = value.trim();
        if value.is_empty() {
            errors.push(format!("{label} is required."));
        }
        value.to_string()
    };

    let requesting_agency = required(&input.requesting_agency, "Requesting agency", &mut errors);
    let title = required(&input.title, "Service title", &mut errors);
    let activity_type = required(&input.activity_type, "Activity type", &mut errors);
    let activity_specification =
        required(&input.activity_specification, "Activity specification", &mut errors);
    let description = required(&input.description, "Service description", &mut errors);
    let address = required(&input.address, "Address", &mut errors);
    let house_number = required(&input.house_number, "House number", &mut errors);
    let neighborhood = required(&input.neighborhood, "Neighborhood", &mut errors);
    let payment_method = required(&input.payment_method, "Payment method", &mut errors);
    let payment_term = required(&input.payment_term, "Payment term", &mut errors);
    let expiration_raw = required(&input.expiration_deadline, "Expiration deadline", &mut errors);
    let execution_raw = required(&input.execution_deadline, "Execution deadline", &mut errors);

    if !house_number.is_empty() && !is_house_number(&house_number) {
        errors.push("House number must contain only digits.".to_string());
    }

    let expiration_deadline = deadline_or_error(&expiration_raw, "Expiration deadline", &mut errors);
    let execution_deadline = deadline_or_error(&execution_raw, "Execution deadline", &mut errors);

    if !requesting_agency.is_empty()
        && !config.agencies.is_empty()
        && !config.agencies.contains(&requesting_agency)
    {
        errors.push(format!("Unknown requesting agency: {requesting_agency}."));
    }

    if !activity_type.is_empty() {
        if !config.activity_types.contains(&activity_type) {
            errors.push(format!("Unknown activity type: {activity_type}."));
        } else if !activity_specification.is_empty()
            && !config.allows_specification(&activity_type, &activity_specification)
        {
            errors.push(format!(
                "Activity specification '{activity_specification}' is not valid for activity type '{activity_type}'."
            ));
        }
    }

    if !payment_method.is_empty() && !config.payment_methods.contains(&payment_method) {
        errors.push(format!("Unknown payment method: {payment_method}."));
    }

    let additional_information = Some(input.additional_information.trim().to_string())
        .filter(|info| !info.is_empty());

    match (expiration_deadline, execution_deadline) {
        (Some(expiration_deadline), Some(execution_deadline)) if errors.is_empty() => {
            Ok(ListingFields {
                requesting_agency,
                title,
                activity_type,
                activity_specification,
                description,
                additional_information,
                address,
                house_number,
                neighborhood,
                payment_method,
                payment_term,
                expiration_deadline,
                execution_deadline,
            })
        }
        _ => Err(errors),
    }
}

fn deadline_or_error(raw: &str, label: &str, errors: &mut Vec<String>) -> Option<NaiveDate> {
    if raw.is_empty() {
        return None;
    }
    let parsed = parse_deadline(raw);
    if parsed.is_none() {
        errors.push(format!("{label} must be a valid date (DD/MM/YYYY)."));
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FormConfiguration {
        let mut config = FormConfiguration::new(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        config.agencies = vec!["Secretaria de Obras".into()];
        config.activity_types = vec!["Eletricista".into(), "Pedreiro".into()];
        config.specifications.insert(
            "Eletricista".into(),
            vec!["Instalação de tomadas".into(), "Troca de fiação".into()],
        );
        config
            .specifications
            .insert("Pedreiro".into(), vec!["Reboco".into()]);
        config
    }

    fn submission() -> NewListing {
        NewListing {
            requesting_agency: "Secretaria de Obras".into(),
            title: "Reparo elétrico na escola".into(),
            activity_type: "Eletricista".into(),
            activity_specification: "Troca de fiação".into(),
            description: "Trocar a fiação do bloco B".into(),
            additional_information: "  ".into(),
            address: "Rua das Flores".into(),
            house_number: "120".into(),
            neighborhood: "Centro".into(),
            payment_method: "Transferência".into(),
            payment_term: "30 dias".into(),
            expiration_deadline: "15/02/2024".into(),
            execution_deadline: "2024-03-01".into(),
        }
    }

    #[test]
    fn house_numbers_with_non_digits_are_flagged() {
        for bad in ["12a", "S/N", " 12", "1 2", "-5", "", "١٢"] {
            let violations = preflight_violations(bad, "01/01/2024");
            assert_eq!(violations.len(), 1, "input {bad:?}");
        }
        assert!(preflight_violations("0042", "01/01/2024").is_empty());
    }

    #[test]
    fn expiration_deadline_is_checked_lexically_only() {
        for bad in ["2024-01-01", "1/1/2024", "32/01/2024", "01/13/2024", "01/01/24", "00/01/2024"] {
            assert!(!is_lexical_date(bad), "input {bad:?}");
        }
        for good in ["01/01/2024", "31/02/2024", "31/12/9999", "29/02/2023"] {
            assert!(is_lexical_date(good), "input {good:?}");
        }
    }

    #[test]
    fn preflight_reports_all_violations_at_once() {
        let violations = preflight_violations("12B", "2024-01-01");
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn valid_submission_is_trimmed_and_typed() {
        let fields = validate_submission(&submission(), &config()).expect("valid");
        assert_eq!(fields.additional_information, None);
        assert_eq!(fields.expiration_deadline, NaiveDate::from_ymd_opt(2024, 2, 15).unwrap());
        assert_eq!(fields.execution_deadline, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn specification_outside_activity_type_is_rejected() {
        let mut input = submission();
        input.activity_specification = "Reboco".into();
        let errors = validate_submission(&input, &config()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("not valid for activity type"));
    }

    #[test]
    fn calendar_invalid_dates_are_rejected_by_the_server_rules() {
        let mut input = submission();
        input.expiration_deadline = "31/02/2024".into();
        let errors = validate_submission(&input, &config()).unwrap_err();
        assert_eq!(errors, vec!["Expiration deadline must be a valid date (DD/MM/YYYY).".to_string()]);
    }

    #[test]
    fn missing_fields_are_all_reported() {
        let errors = validate_submission(&NewListing::default(), &config()).unwrap_err();
        assert_eq!(errors.len(), 12);
        assert!(errors.iter().all(|e| e.ends_with("is required.")));
    }

    #[test]
    fn unknown_payment_method_is_rejected() {
        let mut input = submission();
        input.payment_method = "Pix".into();
        assert!(validate_submission(&input, &config()).is_err());
    }

    #[test]
    fn listing_serializes_with_wire_names() {
        let fields = validate_submission(&submission(), &config()).unwrap();
        let listing = ServiceListing {
            id: ListingId(7),
            created_at: DateTime::parse_from_rfc3339("2024-01-10T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            fields,
        };
        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["numero"], "120");
        assert_eq!(json["prazo_expiracao"], "2024-02-15");
        let back: ServiceListing = serde_json::from_value(json).unwrap();
        assert_eq!(back, listing);
    }

    #[test]
    fn session_context_exposes_admin_only_when_authenticated() {
        assert!(SessionContext::Anonymous.admin().is_none());
        let session = AdminSession {
            id: Uuid::new_v4(),
            user_id: 0,
            username: "admin".into(),
            expires_at: Utc::now(),
        };
        assert!(session.is_expired(Utc::now()));
        assert_eq!(SessionContext::Admin(session).admin().unwrap().username, "admin");
    }
}
