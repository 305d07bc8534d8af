//! Scripted inner stages for stage unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use super::stage::{BoxedStage, CreateStage, CurrentPage, PipelineStage, QueryPage, StageFuture};
use crate::errors::PipelineResult;
use crate::pagination::Cancellation;

/// Replays a fixed list of page results
pub(crate) struct ScriptedStage {
    pages: VecDeque<PipelineResult<QueryPage>>,
    current: CurrentPage,
}

impl PipelineStage for ScriptedStage {
    fn move_next<'a>(&'a mut self, _cancellation: &'a Cancellation) -> StageFuture<'a> {
        Box::pin(async move {
            match self.pages.pop_front() {
                Some(page) => {
                    self.current.set(page);
                    true
                }
                None => {
                    self.current.clear();
                    false
                }
            }
        })
    }

    fn current(&self) -> PipelineResult<&QueryPage> {
        self.current.get()
    }

    fn take_current(&mut self) -> Option<PipelineResult<QueryPage>> {
        self.current.take()
    }
}

/// Pages with the given sizes, numbered documents `0..`, state
/// `{"page": n}` on every page but the last
pub(crate) fn numbered_pages(sizes: &[usize]) -> Vec<PipelineResult<QueryPage>> {
    let mut next = 0i64;
    sizes
        .iter()
        .enumerate()
        .map(|(index, &size)| {
            let documents = (0..size)
                .map(|_| {
                    next += 1;
                    json!(next - 1)
                })
                .collect();
            let state = if index + 1 < sizes.len() {
                Some(json!({ "page": index + 1 }))
            } else {
                None
            };
            Ok(QueryPage {
                documents,
                request_charge: 1.0,
                activity_id: format!("activity-{}", index),
                state,
                ..Default::default()
            })
        })
        .collect()
}

/// Pages holding exactly the given documents
pub(crate) fn document_pages(pages: Vec<Vec<Value>>) -> Vec<PipelineResult<QueryPage>> {
    let count = pages.len();
    pages
        .into_iter()
        .enumerate()
        .map(|(index, documents)| {
            Ok(QueryPage {
                documents,
                request_charge: 1.0,
                state: (index + 1 < count).then(|| json!({ "page": index + 1 })),
                ..Default::default()
            })
        })
        .collect()
}

/// Factory that records the token it was created with
pub(crate) fn scripted(
    pages: Vec<PipelineResult<QueryPage>>,
) -> (CreateStage, Arc<Mutex<Option<Option<Value>>>>) {
    let seen = Arc::new(Mutex::new(None));
    let recorder = Arc::clone(&seen);
    let create: CreateStage = Box::new(move |token| {
        *recorder.lock().unwrap() = Some(token);
        Ok(Box::new(ScriptedStage {
            pages: pages.into_iter().collect(),
            current: CurrentPage::default(),
        }) as BoxedStage)
    });
    (create, seen)
}

/// Drain a stage, returning every page or the first error
pub(crate) async fn drain(stage: &mut BoxedStage) -> PipelineResult<Vec<QueryPage>> {
    let cancellation = Cancellation::new();
    let mut pages = Vec::new();
    while stage.move_next(&cancellation).await {
        pages.push(stage.current()?.clone());
    }
    Ok(pages)
}
