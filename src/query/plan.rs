//! Query plan and pipeline factory
//!
//! The plan comes from the query compiler, which is not part of this crate.
//! Stages are always composed in the same order, innermost first:
//! source (or the ORDER BY merge), GROUP BY, DISTINCT, OFFSET, TOP, LIMIT.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::distinct::{DistinctStage, DistinctType};
use super::group_by::{
    AggregateKind, AggregatorLayout, ClientGroupByStage, ComputeGroupByStage, GroupingTable,
};
use super::order_by::{OrderByStage, SortOrder};
use super::skip::SkipStage;
use super::source::SourceStage;
use super::stage::{BoxedStage, CreateStage};
use super::take::{TakeKind, TakeStage};
use crate::config::{ExecutionEnvironment, PipelineConfig};
use crate::errors::{PipelineError, PipelineResult};
use crate::observability::PipelineMetrics;
use crate::pagination::FeedRangeFetcher;
use crate::range::FeedRange;

/// Client-side execution plan for one query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryPlan {
    pub top: Option<usize>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub distinct_type: DistinctType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<GroupByPlan>,
    /// One entry per ORDER BY column; empty when the query is unordered
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<SortOrder>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_by_expressions: Vec<String>,
}

/// GROUP BY part of a plan.
///
/// With no `group_by_expressions` the aggregates fold every row into one
/// group, as for `SELECT COUNT(1) FROM c`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupByPlan {
    pub group_by_expressions: Vec<String>,
    /// Projection aliases in output order
    pub group_by_aliases: Vec<String>,
    /// `null` marks a pass-through (non-aggregate) column
    pub group_by_alias_to_aggregate_type: BTreeMap<String, Option<AggregateKind>>,
    pub aggregates: Vec<AggregateKind>,
    pub has_select_value: bool,
}

impl GroupByPlan {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.group_by_expressions.is_empty() && self.aggregates.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "GROUP BY needs an expression or an aggregate".to_string(),
            ));
        }
        if self.has_select_value {
            if self.aggregates.len() > 1 {
                return Err(PipelineError::InvalidArgument(
                    "SELECT VALUE projects at most one aggregate".to_string(),
                ));
            }
            return Ok(());
        }
        if self.group_by_aliases.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "GROUP BY select list has no aliases".to_string(),
            ));
        }
        if let Some(alias) = self
            .group_by_aliases
            .iter()
            .find(|alias| !self.group_by_alias_to_aggregate_type.contains_key(alias.as_str()))
        {
            return Err(PipelineError::InvalidArgument(format!(
                "alias {:?} has no aggregate type entry",
                alias
            )));
        }
        Ok(())
    }

    pub fn is_aggregate_only(&self) -> bool {
        self.group_by_expressions.is_empty()
    }

    /// Empty table for this plan
    pub fn table(&self) -> GroupingTable {
        if self.is_aggregate_only() {
            GroupingTable::single_group(self.layout())
        } else {
            GroupingTable::new(self.layout())
        }
    }

    pub fn layout(&self) -> AggregatorLayout {
        if self.has_select_value {
            AggregatorLayout::SelectValue(self.aggregates.first().copied())
        } else {
            AggregatorLayout::SelectList(
                self.group_by_aliases
                    .iter()
                    .map(|alias| {
                        let kind = self
                            .group_by_alias_to_aggregate_type
                            .get(alias)
                            .copied()
                            .flatten();
                        (alias.clone(), kind)
                    })
                    .collect(),
            )
        }
    }
}

impl QueryPlan {
    /// Plain cross-partition read: no stages above the source
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn with_top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn with_offset_limit(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn with_distinct(mut self, distinct_type: DistinctType) -> Self {
        self.distinct_type = distinct_type;
        self
    }

    pub fn with_group_by(mut self, group_by: GroupByPlan) -> Self {
        self.group_by = Some(group_by);
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<SortOrder>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let plan: QueryPlan = serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidArgument(format!("invalid query plan: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if !self.order_by.is_empty() {
            if self.group_by.is_some() {
                return Err(PipelineError::InvalidArgument(
                    "ORDER BY cannot be combined with GROUP BY".to_string(),
                ));
            }
            if !self.order_by_expressions.is_empty()
                && self.order_by_expressions.len() != self.order_by.len()
            {
                return Err(PipelineError::InvalidArgument(format!(
                    "{} ORDER BY expressions for {} sort orders",
                    self.order_by_expressions.len(),
                    self.order_by.len()
                )));
            }
        }
        match &self.group_by {
            Some(group_by) => group_by.validate(),
            None => Ok(()),
        }
    }

    /// Stage names, innermost first
    pub fn stage_names(&self) -> Vec<&'static str> {
        let mut names = vec![if self.order_by.is_empty() { "source" } else { "order_by" }];
        match &self.group_by {
            Some(group_by) if group_by.is_aggregate_only() => names.push("aggregate"),
            Some(_) => names.push("group_by"),
            None => {}
        }
        if self.distinct_type != DistinctType::None {
            names.push("distinct");
        }
        if self.offset.is_some() {
            names.push("offset");
        }
        if self.top.is_some() {
            names.push("top");
        }
        if self.limit.is_some() {
            names.push("limit");
        }
        names
    }
}

/// Build the stage chain for `plan` and resume it from `continuation`.
///
/// The continuation is the text a previous page returned; it is size
/// checked and parsed once here, then split among the stages.
pub fn create_pipeline(
    plan: &QueryPlan,
    fetcher: Arc<dyn FeedRangeFetcher>,
    range: FeedRange,
    continuation: Option<&str>,
    config: &PipelineConfig,
    metrics: Arc<PipelineMetrics>,
) -> PipelineResult<BoxedStage> {
    config.validate()?;
    plan.validate()?;
    let token = continuation.map(|text| parse_token(text, config)).transpose()?;

    let environment = config.execution_environment;
    let page_size = config.max_item_count;

    let source_config = config.clone();
    let orders = plan.order_by.clone();
    let mut create: CreateStage = Box::new(move |token: Option<Value>| {
        if orders.is_empty() {
            let stage = SourceStage::new(fetcher, range, token.as_ref(), &source_config, metrics)?;
            return Ok(Box::new(stage) as BoxedStage);
        }
        let stage =
            OrderByStage::new(fetcher, range, orders, token.as_ref(), &source_config, metrics)?;
        Ok(Box::new(stage) as BoxedStage)
    });

    if let Some(group_by) = &plan.group_by {
        let table = group_by.table();
        let inner = create;
        create = Box::new(move |token| match environment {
            ExecutionEnvironment::Client => ClientGroupByStage::create(table, page_size, token, inner),
            ExecutionEnvironment::Compute => {
                ComputeGroupByStage::create(table, page_size, token, inner)
            }
        });
    }

    if plan.distinct_type != DistinctType::None {
        let distinct_type = plan.distinct_type;
        let inner = create;
        create = Box::new(move |token| DistinctStage::create(environment, distinct_type, token, inner));
    }

    if let Some(offset) = plan.offset {
        let inner = create;
        create = Box::new(move |token| SkipStage::create(environment, offset, token, inner));
    }

    if let Some(top) = plan.top {
        let inner = create;
        create = Box::new(move |token| TakeStage::create(environment, TakeKind::Top, top, token, inner));
    }

    if let Some(limit) = plan.limit {
        let inner = create;
        create = Box::new(move |token| {
            TakeStage::create(environment, TakeKind::Limit, limit, token, inner)
        });
    }

    create(token)
}

fn parse_token(text: &str, config: &PipelineConfig) -> PipelineResult<Value> {
    if let Some(limit) = config.max_continuation_token_bytes {
        if text.len() > limit {
            return Err(PipelineError::malformed(
                text,
                format!("token is {} bytes, limit is {}", text.len(), limit),
            ));
        }
    }
    serde_json::from_str(text)
        .map_err(|e| PipelineError::malformed(text, format!("not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn team_sum() -> GroupByPlan {
        GroupByPlan {
            group_by_expressions: vec!["c.team".to_string()],
            group_by_aliases: vec!["team".to_string(), "total".to_string()],
            group_by_alias_to_aggregate_type: BTreeMap::from([
                ("team".to_string(), None),
                ("total".to_string(), Some(AggregateKind::Sum)),
            ]),
            aggregates: vec![AggregateKind::Sum],
            has_select_value: false,
        }
    }

    #[test]
    fn test_plan_from_compiler_json() {
        let plan = QueryPlan::from_json_str(
            r#"{
                "top": 10,
                "distinctType": "Ordered",
                "groupBy": {
                    "groupByExpressions": ["c.team"],
                    "groupByAliases": ["team", "total"],
                    "groupByAliasToAggregateType": {"team": null, "total": "Sum"},
                    "aggregates": ["Sum"]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(plan.top, Some(10));
        assert_eq!(plan.distinct_type, DistinctType::Ordered);
        assert_eq!(plan.group_by.as_ref().unwrap(), &team_sum());
        assert_eq!(plan.stage_names(), vec!["source", "group_by", "distinct", "top"]);
    }

    #[test]
    fn test_layout_follows_alias_order() {
        assert_eq!(
            team_sum().layout(),
            AggregatorLayout::SelectList(vec![
                ("team".to_string(), None),
                ("total".to_string(), Some(AggregateKind::Sum)),
            ])
        );

        let select_value = GroupByPlan {
            group_by_expressions: vec!["c.team".to_string()],
            aggregates: vec![AggregateKind::Count],
            has_select_value: true,
            ..Default::default()
        };
        assert_eq!(
            select_value.layout(),
            AggregatorLayout::SelectValue(Some(AggregateKind::Count))
        );
    }

    #[test]
    fn test_invalid_group_by_plans() {
        let mut missing_alias = team_sum();
        missing_alias.group_by_alias_to_aggregate_type.remove("total");
        assert!(missing_alias.validate().is_err());

        let mut nothing_to_group = team_sum();
        nothing_to_group.group_by_expressions.clear();
        nothing_to_group.aggregates.clear();
        assert!(nothing_to_group.validate().is_err());

        let two_values = GroupByPlan {
            group_by_expressions: vec!["c.team".to_string()],
            aggregates: vec![AggregateKind::Count, AggregateKind::Sum],
            has_select_value: true,
            ..Default::default()
        };
        assert!(matches!(
            two_values.validate(),
            Err(PipelineError::InvalidArgument(_))
        ));

        assert!(QueryPlan::from_json_str(r#"{"top": "ten"}"#).is_err());
    }

    #[test]
    fn test_aggregate_only_plan() {
        let plan = QueryPlan::from_json_str(
            r#"{
                "groupBy": {
                    "groupByAliasToAggregateType": {"n": "Count"},
                    "groupByAliases": ["n"],
                    "aggregates": ["Count"]
                }
            }"#,
        )
        .unwrap();

        let group_by = plan.group_by.as_ref().unwrap();
        assert!(group_by.is_aggregate_only());
        assert_eq!(plan.stage_names(), vec!["source", "aggregate"]);
        assert!(!team_sum().is_aggregate_only());
    }

    #[test]
    fn test_order_by_plans() {
        let plan = QueryPlan::from_json_str(
            r#"{
                "orderBy": ["Descending", "Ascending"],
                "orderByExpressions": ["c.score", "c.id"],
                "top": 5
            }"#,
        )
        .unwrap();
        assert_eq!(plan.order_by, vec![SortOrder::Descending, SortOrder::Ascending]);
        assert_eq!(plan.stage_names(), vec!["order_by", "top"]);

        let mismatched = QueryPlan {
            order_by_expressions: vec!["c.score".to_string()],
            ..plan.clone()
        };
        assert!(mismatched.validate().is_err());

        let grouped = plan.with_group_by(team_sum());
        assert!(matches!(
            grouped.validate(),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_plan_serializes_camel_case() {
        let plan = QueryPlan::passthrough().with_offset_limit(2, 5);
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["offset"], json!(2));
        assert_eq!(value["distinctType"], json!("None"));
        assert!(value.get("groupBy").is_none());
        assert!(value.get("orderBy").is_none());
    }

    #[test]
    fn test_parse_token_guards() {
        let config = PipelineConfig {
            max_continuation_token_bytes: Some(8),
            ..Default::default()
        };
        assert!(matches!(
            parse_token("{\"limit\":1000}", &config),
            Err(PipelineError::MalformedContinuationToken { .. })
        ));
        assert!(matches!(
            parse_token("[oops", &PipelineConfig::default()),
            Err(PipelineError::MalformedContinuationToken { .. })
        ));
        assert_eq!(parse_token("[]", &config).unwrap(), json!([]));
    }
}
