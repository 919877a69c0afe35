use helmsman::core::membership::{
    Election, ElectionNoVote, ElectionOutcome, ElectionVote, VoteVerdict,
};

fn vote(round: u64, uname: &str, uptime_ms: u64, version: &str) -> ElectionVote {
    ElectionVote {
        round,
        uname: uname.to_string(),
        uptime_ms,
        version: version.to_string(),
    }
}

#[test]
fn test_newer_version_wins() {
    let election = Election::new("alpha", "1.0.0");
    election.start();
    assert_eq!(
        election.compare(&vote(1, "beta", 0, "2.0.0")),
        VoteVerdict::RemoteWins
    );
    assert_eq!(
        election.compare(&vote(1, "gamma", u64::MAX, "0.9.0")),
        VoteVerdict::LocalWins
    );
}

#[test]
fn test_longer_uptime_wins_within_a_version() {
    let election = Election::new("alpha", "1.0.0");
    election.start();
    // Our own uptime is near zero; a long-running peer beats us.
    assert_eq!(
        election.compare(&vote(1, "beta", 3_600_000, "1.0.0")),
        VoteVerdict::RemoteWins
    );
}

#[test]
fn test_own_vote_always_wins() {
    let election = Election::new("alpha", "1.0.0");
    election.start();
    assert_eq!(
        election.compare(&vote(1, "alpha", 0, "1.0.0")),
        VoteVerdict::LocalWins
    );
}

#[test]
fn test_round_fast_forwards_to_newest_vote() {
    let election = Election::new("alpha", "1.0.0");
    election.start();
    assert_eq!(election.round(), 1);
    election.compare(&vote(7, "beta", 3_600_000, "1.0.0"));
    assert_eq!(election.round(), 7);
}

#[test]
fn test_win_requires_every_other_controller_to_concede() {
    let election = Election::new("alpha", "1.0.0");
    let my_vote = election.start();
    let others = vec!["beta".to_string(), "gamma".to_string()];

    assert_eq!(election.outcome(&others), ElectionOutcome::Pending);

    election.record_concession(&ElectionNoVote {
        round: my_vote.round,
        uname: "beta".to_string(),
    });
    assert_eq!(election.outcome(&others), ElectionOutcome::Pending);

    election.record_concession(&ElectionNoVote {
        round: my_vote.round,
        uname: "gamma".to_string(),
    });
    assert_eq!(election.outcome(&others), ElectionOutcome::Won);
}

#[test]
fn test_stale_concessions_are_ignored() {
    let election = Election::new("alpha", "1.0.0");
    election.start();
    election.record_concession(&ElectionNoVote {
        round: 99,
        uname: "beta".to_string(),
    });
    assert_eq!(
        election.outcome(&["beta".to_string()]),
        ElectionOutcome::Pending
    );
}

#[test]
fn test_conceding_loses_the_round() {
    let election = Election::new("zeta", "1.0.0");
    election.start();
    assert_eq!(
        election.compare(&vote(1, "alpha", 3_600_000, "1.0.0")),
        VoteVerdict::RemoteWins
    );
    assert_eq!(election.outcome(&[]), ElectionOutcome::Lost);
}

#[test]
fn test_lone_node_wins_immediately() {
    let election = Election::new("alpha", "1.0.0");
    election.start();
    assert_eq!(election.outcome(&[]), ElectionOutcome::Won);
}

#[test]
fn test_new_round_clears_previous_concessions() {
    let election = Election::new("alpha", "1.0.0");
    let first = election.start();
    election.record_concession(&ElectionNoVote {
        round: first.round,
        uname: "beta".to_string(),
    });
    election.start();
    assert_eq!(
        election.outcome(&["beta".to_string()]),
        ElectionOutcome::Pending
    );
}
