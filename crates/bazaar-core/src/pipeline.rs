use crate::model::{CREATED_AT_FIELD, ID_FIELD};
use crate::query::{Filter, Pattern, Predicate, Projection, QueryRequest, SortDirection, SortSpec};
use crate::Result;
use serde::{Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

pub const METADATA_FIELD: &str = "metadata";
pub const TOTAL_FIELD: &str = "total";
pub const DATA_FIELD: &str = "data";
pub const COUNT_FIELD: &str = "count";

/// Page branch of a facet; the count branch is always present.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetPage {
    pub skip: u64,
    pub limit: u64,
    pub projection: Option<Projection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(SortSpec),
    Project(Projection),
    /// Emits one document `{metadata: [{total}], data: [...]}`.
    Facet(FacetPage),
    /// Reshapes the facet output into `{data, count}`.
    GroupCount,
}

impl Stage {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Stage::Match(f) => json!({ "$match": f }),
            Stage::Sort(s) => json!({ "$sort": s }),
            Stage::Project(p) => json!({ "$project": p }),
            Stage::Facet(page) => {
                let mut data = vec![json!({ "$skip": page.skip }), json!({ "$limit": page.limit })];
                if let Some(p) = &page.projection {
                    data.push(json!({ "$project": p }));
                }
                json!({
                    "$facet": {
                        METADATA_FIELD: [{ "$count": TOTAL_FIELD }],
                        DATA_FIELD: data,
                    }
                })
            }
            Stage::GroupCount => json!({
                "$project": {
                    DATA_FIELD: 1,
                    COUNT_FIELD: { "$arrayElemAt": [format!("${METADATA_FIELD}.{TOTAL_FIELD}"), 0] },
                }
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_paginated(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Facet(_)))
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.stages.iter().map(Stage::to_json).collect())
    }
}

impl Serialize for Pipeline {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Turns a [`QueryRequest`] into an aggregation pipeline for one entity type.
#[derive(Debug, Clone)]
pub struct QueryCompiler {
    display_field: String,
    reference_paths: Vec<String>,
}

impl QueryCompiler {
    pub fn new(display_field: impl Into<String>) -> Self {
        Self {
            display_field: display_field.into(),
            reference_paths: Vec::new(),
        }
    }

    pub fn with_reference_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reference_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn display_field(&self) -> &str {
        &self.display_field
    }

    fn is_reference(&self, path: &str) -> bool {
        path == ID_FIELD
            || path.ends_with(&format!(".{ID_FIELD}"))
            || self.reference_paths.iter().any(|p| p == path)
    }

    pub fn compile(&self, req: &QueryRequest, search: Option<&str>) -> Result<Pipeline> {
        let mut stages = Vec::new();

        let mut predicate = Filter(
            req.filter
                .clone()
                .unwrap_or_default()
                .0
                .into_iter()
                .map(|(k, p)| {
                    let p = if self.is_reference(&k) { p.coerce_ids() } else { p };
                    (k, p)
                })
                .collect(),
        );
        if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
            predicate = predicate.with(
                self.display_field.clone(),
                Predicate::Regex(Pattern::contains(term)),
            );
        }
        // surface bad patterns as caller defects before touching storage
        predicate.compile()?;
        if !predicate.is_empty() {
            stages.push(Stage::Match(predicate));
        }

        let sort = req
            .sort
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| SortSpec::by(CREATED_AT_FIELD, SortDirection::Desc));
        stages.push(Stage::Sort(sort));

        let select = req.select.clone().filter(|s| !s.is_empty());
        if let Some(s) = &select {
            s.mode()?;
        }
        match req.pagination {
            None => {
                let projection =
                    select.unwrap_or_else(|| Projection::include([self.display_field.clone()]));
                stages.push(Stage::Project(projection));
            }
            Some(p) => {
                stages.push(Stage::Facet(FacetPage {
                    skip: p.skip(),
                    limit: p.page_size,
                    projection: select,
                }));
                stages.push(Stage::GroupCount);
            }
        }
        Ok(Pipeline::new(stages))
    }
}
