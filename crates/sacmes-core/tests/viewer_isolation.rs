//! Broadcasts for one identity never reach another identity's viewers

use proptest::prelude::*;
use sacmes_core::{ChannelHandle, ChannelRole, Identity, ServerMessage, ViewerGroups};
use sacmes_test_utils::{
    connect_agent, drain, join_viewer, sample_filters, sample_params, test_config, test_hub,
    FixedAnalyzer, SAMPLE_FILE,
};
use std::sync::Arc;

proptest! {
    #[test]
    fn broadcast_reaches_exactly_the_target_group(
        assignment in prop::collection::vec(0usize..4, 1..24),
        target in 0usize..4,
    ) {
        let groups = ViewerGroups::new();
        let identities: Vec<Identity> = (0..4).map(|i| Identity::new(format!("user-{i}"))).collect();

        let mut viewers = Vec::new();
        for &owner in &assignment {
            let (handle, rx) = ChannelHandle::new(ChannelRole::Viewer);
            groups.join(&identities[owner], handle);
            viewers.push((owner, rx));
        }

        let msg = ServerMessage::FileProcessingComplete { filename: "x_10Hz_1.txt".into() };
        let delivered = groups.broadcast(&identities[target], &msg);
        prop_assert_eq!(delivered, assignment.iter().filter(|&&o| o == target).count());

        for (owner, mut rx) in viewers {
            let got = rx.try_recv().ok();
            if owner == target {
                prop_assert_eq!(got, Some(msg.clone()));
            } else {
                prop_assert_eq!(got, None);
            }
        }
    }
}

#[tokio::test]
async fn analysis_updates_stay_with_their_identity() {
    let hub = test_hub(test_config(2), Arc::new(FixedAnalyzer(4.0)));
    let alice = connect_agent(&hub, "alice").await;
    let _bob = connect_agent(&hub, "bob").await;
    let (alice_viewer, _) = join_viewer(&hub, "alice").await;
    let (mut bob_viewer, _) = join_viewer(&hub, "bob").await;

    hub.start_session(&alice.identity, &alice_viewer.channel, sample_params(), sample_filters())
        .await
        .unwrap();
    let task = hub
        .file_received(&alice.identity, alice.channel.id(), "h_10Hz_1.txt".into(), SAMPLE_FILE.into())
        .await
        .unwrap();
    task.await.unwrap();

    let leaked: Vec<ServerMessage> = drain(&mut bob_viewer.rx)
        .into_iter()
        .filter(|m| {
            matches!(
                m,
                ServerMessage::AnalysisUpdate { .. } | ServerMessage::FileValidationError { .. }
            )
        })
        .collect();
    assert!(leaked.is_empty(), "bob saw {leaked:?}");

    // alice's own replay reflects the value
    let (_, greeting) = join_viewer(&hub, "alice").await;
    assert!(matches!(
        &greeting[1],
        ServerMessage::HistoricalReplay { results, .. } if results.len() == 1
    ));
}
