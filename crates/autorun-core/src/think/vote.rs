// Majority vote across planner candidates.

use autorun_types::VoteRecord;

use crate::plan::PlanDraft;

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Identity a candidate is voted under: its declared candidate id, else its
/// normalised step titles.
pub fn candidate_key(draft: &PlanDraft) -> String {
    if let Some(id) = draft
        .candidate_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return id.to_lowercase();
    }
    draft
        .plan
        .work_steps()
        .map(|(_, s)| normalize_title(&s.title))
        .collect::<Vec<_>>()
        .join("|")
}

pub fn titles_key<'a>(titles: impl IntoIterator<Item = &'a str>) -> String {
    titles
        .into_iter()
        .map(normalize_title)
        .collect::<Vec<_>>()
        .join("|")
}

/// Counts `(voter, key)` ballots. Returns the position of the first ballot
/// carrying the winning key, and one record per distinct key in first-seen
/// order. Ties go to the key seen first.
pub fn tally(ballots: &[(String, String)]) -> Option<(usize, Vec<VoteRecord>)> {
    let mut first_seen: Vec<usize> = Vec::new();
    let mut records: Vec<VoteRecord> = Vec::new();
    for (position, (voter, key)) in ballots.iter().enumerate() {
        match records.iter_mut().find(|r| &r.candidate_id == key) {
            Some(record) => record.planners.push(voter.clone()),
            None => {
                first_seen.push(position);
                records.push(VoteRecord {
                    candidate_id: key.clone(),
                    planners: vec![voter.clone()],
                });
            }
        }
    }

    let mut winner: Option<usize> = None;
    for (i, record) in records.iter().enumerate() {
        let better = match winner {
            None => true,
            Some(w) => record.planners.len() > records[w].planners.len(),
        };
        if better {
            winner = Some(i);
        }
    }
    winner.map(|w| (first_seen[w], records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorun_types::{ActionKind, Plan, Step};

    fn ballot(voter: &str, key: &str) -> (String, String) {
        (voter.to_string(), key.to_string())
    }

    #[test]
    fn majority_wins() {
        let ballots = vec![ballot("p1", "a"), ballot("p2", "b"), ballot("p3", "b")];
        let (winner, records) = tally(&ballots).unwrap();
        assert_eq!(winner, 1);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].planners, vec!["p2", "p3"]);
    }

    #[test]
    fn tie_goes_to_first_seen() {
        let ballots = vec![
            ballot("p1", "x"),
            ballot("p2", "y"),
            ballot("p3", "y"),
            ballot("p4", "x"),
        ];
        let (winner, _) = tally(&ballots).unwrap();
        assert_eq!(winner, 0);
        assert!(tally(&[]).is_none());
    }

    #[test]
    fn key_prefers_candidate_id_then_titles() {
        let plan = Plan::new(
            vec![
                Step::new("s1", "Write  Report", [ActionKind::WriteFile]),
                Step::new("s2", "final_output", [ActionKind::FinalOutput]),
            ],
            vec![],
        );
        let draft = PlanDraft {
            plan: plan.clone(),
            candidate_id: None,
        };
        assert_eq!(candidate_key(&draft), "write report|final_output");
        let named = PlanDraft {
            plan,
            candidate_id: Some(" Alpha ".to_string()),
        };
        assert_eq!(candidate_key(&named), "alpha");
    }
}
