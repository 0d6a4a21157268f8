//! A multi-planner-backed matcher over a single aggregate resource pool.
//!
//! This stands in for the full resource-graph matcher wherever a real
//! resource model is wanted without one: scenario tests and local
//! experiments. Jobs request flat per-type counts (see
//! [`crate::jobspec::JobSpec`]); allocation places a span at the current
//! time, reservation places it at the earliest time the multi-planner
//! finds. A portion of each pool can be marked down to exercise
//! topology-blocked reservations: requests that fit the configured
//! capacity but not the up capacity answer resource-busy.

use std::collections::{
    BTreeMap,
    HashMap,
};

use common::ResourceType;
use errors::ErrorMetadata;
use planner::{
    MultiPlanner,
    MultiSpanId,
};
use qpolicy::{
    job::JobId,
    matcher::{
        Allocation,
        MatchAdapter,
        MatchFailure,
        MatchRequest,
        MatchStatus,
        Matcher,
    },
};
use serde_json::json;

use crate::jobspec::JobSpec;

enum Outcome {
    Allocated { r: String },
    Reserved { r: String, at: i64 },
    Failed(MatchFailure),
}

pub struct SimMatcher {
    multi: MultiPlanner,
    /// Configured capacity per type; the planner totals track the up
    /// capacity, which shrinks while nodes are down.
    configured: BTreeMap<ResourceType, u64>,
    down: BTreeMap<ResourceType, u64>,
    allocations: HashMap<JobId, MultiSpanId>,
    now: i64,
}

impl SimMatcher {
    pub fn new(horizon: u64, resources: &[(&str, u64)]) -> anyhow::Result<Self> {
        let typed: Vec<(ResourceType, u64)> = resources
            .iter()
            .map(|&(name, total)| (ResourceType::intern(name), total))
            .collect();
        Ok(Self {
            multi: MultiPlanner::new(0, horizon, &typed)?,
            configured: typed.into_iter().collect(),
            down: BTreeMap::new(),
            allocations: HashMap::new(),
            now: 0,
        })
    }

    /// Marks `count` units of `resource` down, shrinking the up capacity.
    pub fn set_down(&mut self, resource: &str, count: u64) -> anyhow::Result<()> {
        let resource = ResourceType::intern(resource);
        if !self.configured.contains_key(&resource) {
            anyhow::bail!(ErrorMetadata::not_found(
                "UnknownResourceType",
                format!("no pool for resource type {resource}"),
            ));
        }
        self.down.insert(resource, count);
        self.apply_capacity()
    }

    /// Returns all pools to full capacity.
    pub fn set_all_up(&mut self) -> anyhow::Result<()> {
        self.down.clear();
        self.apply_capacity()
    }

    fn apply_capacity(&mut self) -> anyhow::Result<()> {
        let totals: Vec<(ResourceType, u64)> = self
            .configured
            .iter()
            .map(|(&rt, &total)| {
                let down = self.down.get(&rt).copied().unwrap_or(0);
                (rt, total.saturating_sub(down))
            })
            .collect();
        self.multi.update(&totals)
    }

    fn up_capacity(&self, resource: ResourceType) -> u64 {
        let total = self.configured.get(&resource).copied().unwrap_or(0);
        total.saturating_sub(self.down.get(&resource).copied().unwrap_or(0))
    }

    /// Requested counts aligned to the multi-planner's type order.
    fn aligned_requests(&self, spec: &JobSpec) -> anyhow::Result<Vec<u64>> {
        for name in spec.resources.keys() {
            if !self.configured.contains_key(&ResourceType::intern(name)) {
                anyhow::bail!(ErrorMetadata::unsatisfiable(
                    "UnknownResourceType",
                    format!("no pool for requested resource type {name}"),
                ));
            }
        }
        (0..self.multi.resources_len())
            .map(|i| {
                let rt = self.multi.resource_type_at(i)?;
                Ok(spec.resources.get(rt.as_str()).copied().unwrap_or(0))
            })
            .collect()
    }

    fn try_place(&mut self, req: &MatchRequest, orelse_reserve: bool) -> anyhow::Result<Outcome> {
        let spec = JobSpec::parse(&req.jobspec)?;
        let requests = match self.aligned_requests(&spec) {
            Ok(requests) => requests,
            Err(_) => return Ok(Outcome::Failed(MatchFailure::Unsatisfiable)),
        };
        for (name, &count) in &spec.resources {
            let rt = ResourceType::intern(name);
            if count > self.configured[&rt] {
                // can never fit, regardless of what is up
                return Ok(Outcome::Failed(MatchFailure::Unsatisfiable));
            }
            if count > self.up_capacity(rt) {
                // fits the configured capacity but not the up capacity
                return Ok(Outcome::Failed(MatchFailure::ResourceBusy));
            }
        }
        if self.multi.avail_during(self.now, spec.duration, &requests)? {
            let span = self.multi.add_span(self.now, spec.duration, &requests)?;
            self.allocations.insert(req.id, span);
            return Ok(Outcome::Allocated {
                r: req.jobspec.clone(),
            });
        }
        if !orelse_reserve {
            return Ok(Outcome::Failed(MatchFailure::ResourceBusy));
        }
        match self.multi.avail_time_first(self.now, spec.duration, &requests)? {
            Some(at) => {
                let span = self.multi.add_span(at, spec.duration, &requests)?;
                self.allocations.insert(req.id, span);
                Ok(Outcome::Reserved {
                    r: req.jobspec.clone(),
                    at,
                })
            },
            None => Ok(Outcome::Failed(MatchFailure::ResourceBusy)),
        }
    }

    fn lookup_span(&self, id: JobId, noent_ok: bool) -> anyhow::Result<Option<MultiSpanId>> {
        match self.allocations.get(&id) {
            Some(&span) => Ok(Some(span)),
            None if noent_ok => Ok(None),
            None => anyhow::bail!(ErrorMetadata::not_found(
                "AllocationNotFound",
                format!("job {id} holds no allocation"),
            )),
        }
    }
}

impl Matcher for SimMatcher {
    fn match_allocate_multi(
        &mut self,
        orelse_reserve: bool,
        jobs: &[MatchRequest],
        adapter: &mut dyn MatchAdapter,
    ) -> anyhow::Result<()> {
        for req in jobs {
            if !adapter.is_sched_loop_active() {
                break;
            }
            match self.try_place(req, orelse_reserve) {
                Ok(Outcome::Allocated { r }) => {
                    adapter.handle_match_success(
                        self,
                        req.id,
                        MatchStatus::Allocated,
                        &r,
                        0,
                        0.0,
                    )?;
                },
                Ok(Outcome::Reserved { r, at }) => {
                    adapter.handle_match_success(
                        self,
                        req.id,
                        MatchStatus::Reserved,
                        &r,
                        at,
                        0.0,
                    )?;
                },
                Ok(Outcome::Failed(failure)) => {
                    adapter.handle_match_failure(self, req.id, failure)?;
                },
                Err(e) => {
                    adapter.handle_match_failure(
                        self,
                        req.id,
                        MatchFailure::Other(format!("{e:#}")),
                    )?;
                },
            }
        }
        // End of stream; only meaningful while the loop still runs.
        if adapter.is_sched_loop_active() {
            adapter.handle_match_failure(self, JobId(0), MatchFailure::NoData)?;
        }
        Ok(())
    }

    fn update_allocate(&mut self, id: JobId, r: &str) -> anyhow::Result<Allocation> {
        let spec = JobSpec::parse(r)?;
        let requests = self.aligned_requests(&spec)?;
        let span = self.multi.add_span(self.now, spec.duration, &requests)?;
        self.allocations.insert(id, span);
        Ok(Allocation {
            r: r.to_owned(),
            at: 0,
            ov: 0.0,
        })
    }

    fn cancel(&mut self, id: JobId, noent_ok: bool) -> anyhow::Result<()> {
        if let Some(span) = self.lookup_span(id, noent_ok)? {
            self.multi.rem_span(span)?;
            self.allocations.remove(&id);
        }
        Ok(())
    }

    fn partial_cancel(&mut self, id: JobId, r: &str, noent_ok: bool) -> anyhow::Result<bool> {
        let Some(span) = self.lookup_span(id, noent_ok)? else {
            return Ok(true);
        };
        let spec = JobSpec::parse(r)?;
        let reductions: Vec<(ResourceType, u64)> = spec
            .resources
            .iter()
            .map(|(name, &count)| (ResourceType::intern(name), count))
            .collect();
        let removed = self.multi.reduce_span(span, &reductions)?;
        if removed {
            self.allocations.remove(&id);
        }
        Ok(removed)
    }

    fn resource_status(&self) -> anyhow::Result<serde_json::Value> {
        let mut pools = serde_json::Map::new();
        for (&rt, &total) in &self.configured {
            pools.insert(
                rt.as_str().to_owned(),
                json!({
                    "total": total,
                    "up": self.up_capacity(rt),
                    "free_now": self.planner_free_now(rt)?,
                }),
            );
        }
        Ok(json!({ "resources": pools }))
    }

    fn feasibility(&self, jobspec: &str) -> anyhow::Result<serde_json::Value> {
        let spec = JobSpec::parse(jobspec)?;
        let feasible = spec.resources.iter().all(|(name, &count)| {
            self.configured
                .get(&ResourceType::intern(name))
                .is_some_and(|&total| count <= total)
        });
        Ok(json!({ "feasible": feasible }))
    }
}

impl SimMatcher {
    fn planner_free_now(&self, rt: ResourceType) -> anyhow::Result<i64> {
        for i in 0..self.multi.resources_len() {
            if self.multi.resource_type_at(i)? == rt {
                return self.multi.avail_resources_at(self.now, i);
            }
        }
        anyhow::bail!(ErrorMetadata::not_found(
            "UnknownResourceType",
            format!("no pool for resource type {rt}"),
        ));
    }
}
