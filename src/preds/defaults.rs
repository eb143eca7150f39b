// Project-independent classifiers
// The default scoring table applied to every dashboard

use crate::review::change::{Authority, Change, Needs, Status};

use super::{Predicate, Reject};

/// Commits above which an author counts as an established contributor.
const CONTRIBUTOR_COMMITS: u32 = 10;
/// Commits above which an author counts as a major contributor.
const MAJOR_CONTRIBUTOR_COMMITS: u32 = 50;

/// The built-in predicate set. Projects append their own.
pub fn default_predicates() -> Vec<Predicate> {
    vec![
        Predicate::new(
            "authorMaintainer",
            "the author is a maintainer or owner",
            10,
            |c: &dyn Change| Ok(c.author().authority >= Authority::Maintainer),
        ),
        Predicate::new(
            "authorReviewer",
            "the author is an established reviewer",
            1,
            |c: &dyn Change| Ok(c.author().authority == Authority::Reviewer),
        ),
        Predicate::new(
            "authorContributor",
            "the author has more than 10 merged commits",
            1,
            |c: &dyn Change| Ok(c.author().commits > CONTRIBUTOR_COMMITS),
        ),
        Predicate::new(
            "authorMajorContributor",
            "the author has more than 50 merged commits",
            10,
            |c: &dyn Change| Ok(c.author().commits > MAJOR_CONTRIBUTOR_COMMITS),
        ),
        Predicate::new(
            "noMaintainerReviews",
            "no maintainer has reviewed or been asked to review",
            1,
            |c: &dyn Change| {
                let has_maintainer = c
                    .reviewed()
                    .iter()
                    .chain(c.reviewers().iter())
                    .any(|a| a.authority >= Authority::Maintainer);
                Ok(!has_maintainer)
            },
        ),
        Predicate::new(
            "mergeConflict",
            "the change no longer merges cleanly",
            -1,
            |c: &dyn Change| Ok(c.needs().contains(Needs::CONFLICT_RESOLVE)),
        ),
    ]
}

/// The built-in reject set.
pub fn default_rejects() -> Vec<Reject> {
    vec![Reject::new(
        "unreviewable",
        "submitted, closed, or marked do-not-review",
        |c: &dyn Change| {
            Ok(matches!(
                c.status(),
                Status::Submitted | Status::Closed | Status::DoNotReview
            ))
        },
    )]
}
