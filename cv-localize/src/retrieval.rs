use crate::{LocalizeError, Map, Signature, ViewId};
use float_ord::FloatOrd;
use log::*;

/// A map view that may overlap the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub view: ViewId,
    /// Higher is more similar.
    pub score: f32,
}

/// Finds the map views most likely to overlap a query image.
pub trait CandidateRetrieval: Send + Sync {
    /// Returns at most `max` candidates in non-increasing score order.
    ///
    /// An empty list means nothing similar was found. A database that cannot be queried is an
    /// error ([`LocalizeError::RetrievalUnavailable`]).
    fn retrieve(&self, signature: &Signature, max: usize) -> Result<Vec<Candidate>, LocalizeError>;

    /// Whether the database can be queried at all.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Scores every posed view of a map against the query with the cosine similarity of their
/// signatures.
#[derive(Debug, Clone, Default)]
pub struct ExhaustiveRetrieval {
    database: Vec<(ViewId, Signature)>,
}

impl ExhaustiveRetrieval {
    pub fn new(database: Vec<(ViewId, Signature)>) -> Self {
        Self { database }
    }

    /// Indexes the posed views of the map that observe landmarks.
    pub fn from_map(map: &Map) -> Self {
        let database: Vec<(ViewId, Signature)> = map
            .views()
            .filter(|&(id, view)| {
                view.pose.is_some() && map.regions(id).map_or(false, |r| !r.is_empty())
            })
            .map(|(id, view)| (id, view.signature.clone()))
            .collect();
        info!("indexed {} views for retrieval", database.len());
        Self { database }
    }

    pub fn len(&self) -> usize {
        self.database.len()
    }

    pub fn is_empty(&self) -> bool {
        self.database.is_empty()
    }
}

impl CandidateRetrieval for ExhaustiveRetrieval {
    fn is_ready(&self) -> bool {
        !self.database.is_empty()
    }

    fn retrieve(&self, signature: &Signature, max: usize) -> Result<Vec<Candidate>, LocalizeError> {
        if self.database.is_empty() {
            return Err(LocalizeError::RetrievalUnavailable(
                "the retrieval database is empty".to_string(),
            ));
        }
        if signature.is_empty() {
            return Err(LocalizeError::RetrievalUnavailable(
                "the query has an empty signature".to_string(),
            ));
        }
        let mut candidates: Vec<Candidate> = self
            .database
            .iter()
            .map(|(view, stored)| Candidate {
                view: *view,
                score: signature.cosine_similarity(stored),
            })
            .filter(|candidate| candidate.score > 0.0)
            .collect();
        // Ties keep the lower view id first.
        candidates.sort_by_key(|candidate| {
            (std::cmp::Reverse(FloatOrd(candidate.score)), candidate.view)
        });
        candidates.truncate(max);
        debug!("retrieved {} candidates", candidates.len());
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> ExhaustiveRetrieval {
        ExhaustiveRetrieval::new(vec![
            (ViewId(0), Signature::from_words([1, 2, 3])),
            (ViewId(1), Signature::from_words([1, 1, 1])),
            (ViewId(2), Signature::from_words([7, 8])),
            (ViewId(3), Signature::from_words([1, 2, 3])),
        ])
    }

    #[test]
    fn ranked_by_similarity() {
        let candidates = database()
            .retrieve(&Signature::from_words([1, 2, 3]), 10)
            .unwrap();
        let views: Vec<ViewId> = candidates.iter().map(|c| c.view).collect();
        assert_eq!(views, [ViewId(0), ViewId(3), ViewId(1)]);
        assert!(candidates.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn truncated_to_max() {
        let candidates = database()
            .retrieve(&Signature::from_words([1, 2, 3]), 2)
            .unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn nothing_similar_is_not_an_error() {
        let candidates = database().retrieve(&Signature::from_words([42]), 4).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn unavailable_database() {
        let empty = ExhaustiveRetrieval::default();
        assert!(matches!(
            empty.retrieve(&Signature::from_words([1]), 4),
            Err(LocalizeError::RetrievalUnavailable(_))
        ));
        assert!(matches!(
            database().retrieve(&Signature::default(), 4),
            Err(LocalizeError::RetrievalUnavailable(_))
        ));
    }
}
