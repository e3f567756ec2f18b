use polyudp::{
    adapter::UnionAdapterFactory,
    channel::SimpleChannel,
    data_processor::{AesDataProcessorFactory, SecretSharedRowSet},
    process::{UdpProcessApp, UdpProcessGame, UdpProcessOutput},
    secret::{Session, deal_triples, simulated_sessions},
    shuffle::insecure::DummyShufflerFactory,
};

async fn open(set: &SecretSharedRowSet, session: &Session<SimpleChannel>) -> Vec<Vec<u8>> {
    let to_0 = set.open_to_party(session, 0).await.unwrap();
    let to_1 = set.open_to_party(session, 1).await.unwrap();
    to_0.or(to_1).unwrap()
}

async fn run(
    session: Session<SimpleChannel>,
    publisher: bool,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>, UdpProcessOutput) {
    let adapters = UnionAdapterFactory::new(
        session.clone(),
        publisher,
        0,
        1,
        DummyShufflerFactory::new(99),
    );
    let processors = AesDataProcessorFactory::new(session.clone());
    let game = UdpProcessGame::new(adapters, processors, publisher);
    let app = UdpProcessApp::new(session.clone(), game, 30, 9, 5);
    let output = app.run().await.unwrap();
    let publisher_rows = open(&output.publisher, &session).await;
    let partner_rows = open(&output.partner, &session).await;
    session.finish().await.unwrap();
    (publisher_rows, partner_rows, output)
}

#[tokio::test]
async fn both_parties_share_the_matched_rows() {
    let (s0, s1, dealer) = simulated_sessions();
    let (r0, r1, d) = tokio::join!(run(s0, true), run(s1, false), deal_triples(&dealer, [0, 1]));
    d.unwrap();
    let (publisher_rows, partner_rows, output0) = r0;
    let (publisher_rows1, partner_rows1, output1) = r1;
    assert_eq!(publisher_rows, publisher_rows1);
    assert_eq!(partner_rows, partner_rows1);

    // both parties evaluate the same gates
    let (stats0, stats1) = (output0.statistics, output1.statistics);
    assert!(stats0.and_gates > 0);
    assert_eq!(stats0.and_gates, stats1.and_gates);
    assert!(stats0.bytes_sent > 0 && stats1.bytes_sent > 0);

    assert_eq!(publisher_rows.len(), 9);
    assert_eq!(publisher_rows, partner_rows);
    let mut firsts: Vec<u8> = publisher_rows.iter().map(|row| row[0]).collect();
    firsts.sort_unstable();
    assert_eq!(firsts, (0..9).collect::<Vec<u8>>());
    assert!(publisher_rows.iter().all(|row| row == &vec![row[0]; 5]));
}
