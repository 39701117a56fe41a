//! Resource operation matrix.
//!
//! `matrix[held][proposed]` says what happens to a proposal of `proposed`
//! while another call holds `held` on the same resource. The table is total;
//! every diagonal entry is set on purpose.

use crate::domain::Response::{Accepted as A, Postponed as P, Rejected as R};
use crate::domain::ResourceOperation as Op;
use crate::domain::{ResourceOperation, Response};

const OPS: usize = ResourceOperation::ALL.len();

/// Rows: held. Columns: proposed. Order follows [`ResourceOperation::ALL`].
const STANDARD: [[Response; OPS]; OPS] = [
    //            create read update delete sync publish
    /* create  */ [R, P, P, P, P, P],
    /* read    */ [R, A, P, P, A, A],
    /* update  */ [R, P, P, P, P, P],
    /* delete  */ [P, R, R, R, R, R],
    /* sync    */ [R, A, P, R, P, P],
    /* publish */ [R, A, P, R, P, P],
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationMatrix {
    table: [[Response; OPS]; OPS],
}

impl OperationMatrix {
    pub const fn standard() -> Self {
        Self { table: STANDARD }
    }

    /// Override one cell.
    pub fn with_rule(mut self, held: Op, proposed: Op, response: Response) -> Self {
        self.table[held.index()][proposed.index()] = response;
        self
    }

    pub fn response(&self, held: Op, proposed: Op) -> Response {
        self.table[held.index()][proposed.index()]
    }

    /// Held operations that postpone a new proposal of `proposed`.
    pub fn postponing_operations(&self, proposed: Op) -> Vec<Op> {
        self.held_with(proposed, Response::Postponed)
    }

    /// Held operations that reject a new proposal of `proposed`.
    pub fn rejecting_operations(&self, proposed: Op) -> Vec<Op> {
        self.held_with(proposed, Response::Rejected)
    }

    fn held_with(&self, proposed: Op, response: Response) -> Vec<Op> {
        ResourceOperation::ALL
            .into_iter()
            .filter(|held| self.response(*held, proposed) == response)
            .collect()
    }

    /// `(held, proposed, response)` for every cell, row by row.
    pub fn cells(&self) -> impl Iterator<Item = (Op, Op, Response)> + '_ {
        ResourceOperation::ALL.into_iter().flat_map(move |held| {
            ResourceOperation::ALL
                .into_iter()
                .map(move |proposed| (held, proposed, self.response(held, proposed)))
        })
    }
}

impl Default for OperationMatrix {
    fn default() -> Self {
        Self::standard()
    }
}
