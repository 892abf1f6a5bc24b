//! Cash point requests: map queries, create, edit and patch history.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, VecDeque};

use super::{RequestBehavior, RequestSlot, StepCall, StepContext, StepOutcome};
use crate::api::api_types::{parse_id_array, parse_json, parse_object_array, ApiCluster};
use crate::api::types::{CashPoint, Cluster, EntityId};
use crate::cache::Cacheable;

const RUB: u32 = 643;
const USD: u32 = 840;
const EUR: u32 = 978;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  Radius,
  Cluster,
  Create,
  Edit,
  Patches,
}

impl RequestKind {
  pub fn name(self) -> &'static str {
    match self {
      Self::Radius => "radius",
      Self::Cluster => "cluster",
      Self::Create => "create",
      Self::Edit => "edit",
      Self::Patches => "patches",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "radius" => Some(Self::Radius),
      "cluster" => Some(Self::Cluster),
      "create" => Some(Self::Create),
      "edit" => Some(Self::Edit),
      "patches" => Some(Self::Patches),
      _ => None,
    }
  }

  /// Build a request from its JSON input. The error is a user-facing message.
  pub fn parse(self, json: &str) -> Result<Box<dyn RequestBehavior>, String> {
    let name = self.name();
    let value: Value =
      serde_json::from_str(json).map_err(|_| format!("{} malformed json", name))?;
    if !value.is_object() {
      return Err(format!("{} request must be json object", name));
    }

    let invalid = |_| format!("{} request could not be parsed from json", name);
    let behavior: Box<dyn RequestBehavior> = match self {
      Self::Radius => Box::new(RadiusRequest::new(
        serde_json::from_value(value).map_err(invalid)?,
      )),
      Self::Cluster => Box::new(ClusterRequest::new(
        serde_json::from_value(value).map_err(invalid)?,
      )),
      Self::Create => Box::new(CreateRequest::new(
        serde_json::from_value(value).map_err(invalid)?,
      )),
      Self::Edit => Box::new(EditRequest::new(
        serde_json::from_value(value).map_err(invalid)?,
      )),
      Self::Patches => Box::new(PatchesRequest::new(
        serde_json::from_value(value).map_err(invalid)?,
      )),
    };
    Ok(behavior)
  }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
  #[default]
  CashpointData,
  CreateResult,
  EditResult,
  Patches,
}

/// Data a request hands to the UI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CashPointResponse {
  pub kind: ResponseKind,
  /// Received from the server; written to the local store
  pub cashpoints: Vec<CashPoint>,
  /// Served from the local store without a network fetch
  pub cached: Vec<CashPoint>,
  /// Cash points that should be shown on the map
  pub visible: BTreeSet<EntityId>,
  pub clusters: Vec<Cluster>,
  pub created: Vec<EntityId>,
  pub patches: Vec<Value>,
  pub message: String,
}

impl CashPointResponse {
  pub fn new(kind: ResponseKind) -> Self {
    Self {
      kind,
      ..Self::default()
    }
  }

  pub fn message(kind: ResponseKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      ..Self::default()
    }
  }
}

fn http_error(status: u16) -> String {
  format!("Server http response: {}", status)
}

fn is_success(status: u16) -> bool {
  (200..300).contains(&status)
}

// ============================================================================
// Map queries
// ============================================================================

/// Visible map area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaQuery {
  pub longitude: f64,
  pub latitude: f64,
  pub radius: f64,
  #[serde(rename = "topLeft")]
  pub top_left: Map<String, Value>,
  #[serde(rename = "bottomRight")]
  pub bottom_right: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub filter: Option<Map<String, Value>>,
}

/// Cash points around a point: ids first, then records in batches.
pub struct RadiusRequest {
  query: AreaQuery,
  to_fetch: VecDeque<EntityId>,
  /// Batch being fetched; kept across retries
  current: Option<Vec<EntityId>>,
  response: Option<CashPointResponse>,
}

impl RadiusRequest {
  const FETCH_IDS: usize = 0;
  const FETCH_CASHPOINTS: usize = 1;

  pub fn new(query: AreaQuery) -> Self {
    Self {
      query,
      to_fetch: VecDeque::new(),
      current: None,
      response: None,
    }
  }

  fn on_ids(&mut self, body: &[u8], ctx: &StepContext<'_>) -> StepOutcome {
    let ids = match parse_id_array(body) {
      Ok(ids) => ids,
      Err(e) => {
        return StepOutcome::Fail {
          message: format!("radius: {}", e),
        }
      }
    };

    let mut response = CashPointResponse::new(ResponseKind::CashpointData);
    response.visible = ids.iter().copied().collect();
    self.to_fetch.clear();
    self.current = None;

    if ids.is_empty() {
      response.message = "There is no nearby cashpoints".to_string();
      self.response = Some(response);
      return StepOutcome::Complete {
        message: "There is no nearby cashpoints".to_string(),
      };
    }

    for id in ids {
      match ctx.store.cached(id) {
        Some(cached) if ctx.is_fresh(cached.synced_at) => response.cached.push(cached.entity),
        _ => self.to_fetch.push_back(id),
      }
    }
    self.response = Some(response);

    if self.to_fetch.is_empty() {
      StepOutcome::Complete {
        message: "Data of nearby cashpoints received".to_string(),
      }
    } else {
      StepOutcome::Finished {
        ok: true,
        message: "List of nearby cashpoints received".to_string(),
      }
    }
  }

  fn on_cashpoints(&mut self, body: &[u8]) -> StepOutcome {
    let items = match parse_object_array(body) {
      Ok(items) => items,
      Err(e) => {
        return StepOutcome::Fail {
          message: format!("radius: {}", e),
        }
      }
    };

    self.current = None;
    let mut response = CashPointResponse::new(ResponseKind::CashpointData);
    response.cashpoints = items.iter().filter_map(CashPoint::from_wire).collect();
    self.response = Some(response);

    if self.to_fetch.is_empty() {
      StepOutcome::Finished {
        ok: true,
        message: "Data of nearby cashpoints received".to_string(),
      }
    } else {
      StepOutcome::Repeat
    }
  }
}

impl RequestBehavior for RadiusRequest {
  fn name(&self) -> &'static str {
    "radius"
  }

  fn slot(&self) -> RequestSlot {
    RequestSlot::Map
  }

  fn steps(&self) -> &'static [&'static str] {
    &["fetch_ids", "fetch_cashpoints"]
  }

  fn prepare(&mut self, step: usize, ctx: &StepContext<'_>) -> StepCall {
    if step == Self::FETCH_IDS {
      return StepCall::post(
        "/nearby/cashpoints",
        serde_json::to_value(&self.query).unwrap_or_default(),
      );
    }

    let batch_size = ctx.batch_size.max(1);
    let to_fetch = &mut self.to_fetch;
    let batch = self.current.get_or_insert_with(|| {
      let take = batch_size.min(to_fetch.len());
      to_fetch.drain(..take).collect()
    });

    // Ids we already hold go in "cached" so the server can skip unchanged ones
    let (cached, missing): (Vec<EntityId>, Vec<EntityId>) = batch
      .iter()
      .copied()
      .partition(|id| ctx.store.cached(*id).is_some());

    StepCall::post(
      "/cashpoints",
      json!({ "cashpoints": missing, "cached": cached }),
    )
  }

  fn on_reply(&mut self, step: usize, status: u16, body: &[u8], ctx: &StepContext<'_>) -> StepOutcome {
    if !is_success(status) {
      return StepOutcome::Retry {
        reason: http_error(status),
      };
    }
    match step {
      Self::FETCH_IDS => self.on_ids(body, ctx),
      Self::FETCH_CASHPOINTS => self.on_cashpoints(body),
      _ => StepOutcome::Fail {
        message: format!("radius: unknown step {}", step),
      },
    }
  }

  fn take_response(&mut self) -> Option<CashPointResponse> {
    self.response.take()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterQuery {
  #[serde(flatten)]
  pub area: AreaQuery,
  pub zoom: f64,
}

/// Clusters and single cash points for a map area at a zoom level.
pub struct ClusterRequest {
  query: ClusterQuery,
  response: Option<CashPointResponse>,
}

impl ClusterRequest {
  pub fn new(query: ClusterQuery) -> Self {
    Self {
      query,
      response: None,
    }
  }
}

impl RequestBehavior for ClusterRequest {
  fn name(&self) -> &'static str {
    "cluster"
  }

  fn slot(&self) -> RequestSlot {
    RequestSlot::Map
  }

  fn steps(&self) -> &'static [&'static str] {
    &["fetch_clusters"]
  }

  fn prepare(&mut self, _step: usize, _ctx: &StepContext<'_>) -> StepCall {
    let mut body = serde_json::to_value(&self.query.area).unwrap_or_default();
    if let Some(obj) = body.as_object_mut() {
      obj.insert("zoom".to_string(), json!(self.query.zoom.round() as i64));
    }
    StepCall::post("/nearby/clusters", body)
  }

  fn on_reply(&mut self, _step: usize, status: u16, body: &[u8], _ctx: &StepContext<'_>) -> StepOutcome {
    if !is_success(status) {
      return StepOutcome::Retry {
        reason: http_error(status),
      };
    }
    let items = match parse_object_array(body) {
      Ok(items) => items,
      Err(e) => {
        return StepOutcome::Fail {
          message: format!("cluster: {}", e),
        }
      }
    };

    let mut response = CashPointResponse::new(ResponseKind::CashpointData);
    for item in &items {
      let Some(obj) = item.as_object() else {
        continue;
      };
      if obj.contains_key("size") {
        if let Ok(cluster) = ApiCluster::deserialize(item) {
          response.clusters.push(cluster.into());
        }
      } else if let Some(cashpoint) = CashPoint::from_wire(item) {
        response.visible.insert(cashpoint.id);
        response.cashpoints.push(cashpoint);
      }
    }
    self.response = Some(response);

    StepOutcome::Finished {
      ok: true,
      message: "List of nearby clusters received".to_string(),
    }
  }

  fn take_response(&mut self) -> Option<CashPointResponse> {
    self.response.take()
  }
}

// ============================================================================
// Create / edit
// ============================================================================

/// Input of a new cash point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCashPoint {
  #[serde(rename = "type")]
  pub point_type: String,
  pub bank_id: u32,
  pub town_id: u32,
  pub longitude: f64,
  pub latitude: f64,
  pub address: String,
  pub address_comment: String,
  pub metro_name: String,
  pub free_access: bool,
  pub main_office: bool,
  pub without_weekend: bool,
  pub round_the_clock: bool,
  pub works_as_shop: bool,
  pub schedule: String,
  pub tel: String,
  pub additional: String,
  pub rub: bool,
  pub usd: bool,
  pub eur: bool,
  pub cash_in: bool,
}

impl NewCashPoint {
  fn currency(&self) -> Vec<u32> {
    [(self.rub, RUB), (self.usd, USD), (self.eur, EUR)]
      .into_iter()
      .filter_map(|(accepted, code)| accepted.then_some(code))
      .collect()
  }

  fn to_cashpoint(&self, id: EntityId) -> CashPoint {
    CashPoint {
      id,
      point_type: self.point_type.clone(),
      bank_id: self.bank_id,
      town_id: self.town_id,
      longitude: self.longitude,
      latitude: self.latitude,
      address: self.address.clone(),
      address_comment: self.address_comment.clone(),
      metro_name: self.metro_name.clone(),
      main_office: self.main_office,
      without_weekend: self.without_weekend,
      round_the_clock: self.round_the_clock,
      works_as_shop: self.works_as_shop,
      free_access: self.free_access,
      currency: self.currency(),
      cash_in: self.cash_in,
      schedule: self.schedule.clone(),
      timestamp: 0,
      approved: false,
      patch_count: 0,
    }
  }
}

pub struct CreateRequest {
  draft: NewCashPoint,
  response: Option<CashPointResponse>,
}

impl CreateRequest {
  pub fn new(draft: NewCashPoint) -> Self {
    Self {
      draft,
      response: None,
    }
  }
}

impl RequestBehavior for CreateRequest {
  fn name(&self) -> &'static str {
    "create"
  }

  fn slot(&self) -> RequestSlot {
    RequestSlot::Edit
  }

  fn steps(&self) -> &'static [&'static str] {
    &["create_cashpoint"]
  }

  fn prepare(&mut self, _step: usize, _ctx: &StepContext<'_>) -> StepCall {
    StepCall::post(
      "/cashpoint",
      serde_json::to_value(&self.draft).unwrap_or_default(),
    )
  }

  fn on_reply(&mut self, _step: usize, status: u16, body: &[u8], _ctx: &StepContext<'_>) -> StepOutcome {
    if !is_success(status) {
      return StepOutcome::Retry {
        reason: http_error(status),
      };
    }

    let json = match parse_json(body) {
      Ok(json) => json,
      Err(e) => {
        return StepOutcome::Fail {
          message: format!("create: {}", e),
        }
      }
    };
    let Some(ids) = json.get("cash_points").and_then(Value::as_array) else {
      return StepOutcome::Fail {
        message: "create: cash_points field is not an array".to_string(),
      };
    };

    let created: Vec<EntityId> = ids.iter().filter_map(EntityId::from_json).collect();
    if created.is_empty() {
      return StepOutcome::Fail {
        message: "Cannot add new cashpoint to system".to_string(),
      };
    }

    let message = "Cashpoint successfully added to system";
    let mut response = CashPointResponse::message(ResponseKind::CreateResult, message);
    response.cashpoints = created.iter().map(|id| self.draft.to_cashpoint(*id)).collect();
    response.created = created;
    self.response = Some(response);

    StepOutcome::Finished {
      ok: true,
      message: message.to_string(),
    }
  }

  fn take_response(&mut self) -> Option<CashPointResponse> {
    self.response.take()
  }
}

/// Changes to an existing cash point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashPointEdit {
  pub id: EntityId,
  #[serde(rename = "type")]
  pub point_type: String,
  pub bank_id: u32,
  pub town_id: u32,
  pub longitude: f64,
  pub latitude: f64,
  pub address_comment: String,
  pub free_access: bool,
  pub main_office: bool,
  pub without_weekend: bool,
  pub round_the_clock: bool,
  pub works_as_shop: bool,
  pub schedule: Map<String, Value>,
  pub tel: String,
  pub additional: String,
  pub currency: Vec<u32>,
  pub cash_in: bool,
}

impl CashPointEdit {
  /// Apply the edit on top of the stored copy.
  fn apply(&self, base: Option<CashPoint>) -> CashPoint {
    let mut cashpoint = base.unwrap_or_else(|| CashPoint {
      id: self.id,
      point_type: String::new(),
      bank_id: 0,
      town_id: 0,
      longitude: 0.0,
      latitude: 0.0,
      address: String::new(),
      address_comment: String::new(),
      metro_name: String::new(),
      main_office: false,
      without_weekend: false,
      round_the_clock: false,
      works_as_shop: false,
      free_access: false,
      currency: Vec::new(),
      cash_in: false,
      schedule: String::new(),
      timestamp: 0,
      approved: false,
      patch_count: 0,
    });

    cashpoint.point_type = self.point_type.clone();
    cashpoint.bank_id = self.bank_id;
    cashpoint.town_id = self.town_id;
    cashpoint.longitude = self.longitude;
    cashpoint.latitude = self.latitude;
    cashpoint.address_comment = self.address_comment.clone();
    cashpoint.free_access = self.free_access;
    cashpoint.main_office = self.main_office;
    cashpoint.without_weekend = self.without_weekend;
    cashpoint.round_the_clock = self.round_the_clock;
    cashpoint.works_as_shop = self.works_as_shop;
    cashpoint.schedule = Value::Object(self.schedule.clone()).to_string();
    cashpoint.currency = self.currency.clone();
    cashpoint.cash_in = self.cash_in;
    cashpoint
  }
}

pub struct EditRequest {
  edit: CashPointEdit,
  response: Option<CashPointResponse>,
}

impl EditRequest {
  pub fn new(edit: CashPointEdit) -> Self {
    Self {
      edit,
      response: None,
    }
  }
}

impl RequestBehavior for EditRequest {
  fn name(&self) -> &'static str {
    "edit"
  }

  fn slot(&self) -> RequestSlot {
    RequestSlot::Edit
  }

  fn steps(&self) -> &'static [&'static str] {
    &["edit_cashpoint"]
  }

  fn prepare(&mut self, _step: usize, _ctx: &StepContext<'_>) -> StepCall {
    StepCall::post(
      "/cashpoint",
      json!({
        "user_id": 0,
        "data": serde_json::to_value(&self.edit).unwrap_or_default(),
      }),
    )
  }

  fn on_reply(&mut self, _step: usize, status: u16, _body: &[u8], ctx: &StepContext<'_>) -> StepOutcome {
    if !is_success(status) {
      return StepOutcome::Fail {
        message: http_error(status),
      };
    }

    let base = ctx.store.cached(self.edit.id).map(|cached| cached.entity);
    let message = "Cashpoint successfully edited";
    let mut response = CashPointResponse::message(ResponseKind::EditResult, message);
    response.cashpoints.push(self.edit.apply(base));
    self.response = Some(response);

    StepOutcome::Finished {
      ok: true,
      message: message.to_string(),
    }
  }

  fn take_response(&mut self) -> Option<CashPointResponse> {
    self.response.take()
  }
}

// ============================================================================
// Patches
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PatchesQuery {
  pub id: EntityId,
}

/// Pending user edits of one cash point.
pub struct PatchesRequest {
  query: PatchesQuery,
  response: Option<CashPointResponse>,
}

impl PatchesRequest {
  pub fn new(query: PatchesQuery) -> Self {
    Self {
      query,
      response: None,
    }
  }
}

impl RequestBehavior for PatchesRequest {
  fn name(&self) -> &'static str {
    "patches"
  }

  fn slot(&self) -> RequestSlot {
    RequestSlot::Patches
  }

  fn steps(&self) -> &'static [&'static str] {
    &["fetch_patches"]
  }

  fn prepare(&mut self, _step: usize, _ctx: &StepContext<'_>) -> StepCall {
    StepCall::get(format!("/cashpoint/{}/patches", self.query.id))
  }

  fn on_reply(&mut self, _step: usize, status: u16, body: &[u8], _ctx: &StepContext<'_>) -> StepOutcome {
    if !is_success(status) {
      return StepOutcome::Retry {
        reason: http_error(status),
      };
    }
    let patches = match parse_object_array(body) {
      Ok(patches) => patches,
      Err(e) => {
        return StepOutcome::Fail {
          message: format!("patches: {}", e),
        }
      }
    };

    let message = "Patches of cashpoint received";
    let mut response = CashPointResponse::message(ResponseKind::Patches, message);
    response.patches = patches;
    self.response = Some(response);

    StepOutcome::Finished {
      ok: true,
      message: message.to_string(),
    }
  }

  fn take_response(&mut self) -> Option<CashPointResponse> {
    self.response.take()
  }
}
