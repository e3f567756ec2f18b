use polyudp::{
    channel::SimpleChannel,
    data_processor::{
        AesDataProcessor, DataProcessor, Error, SecretSharedRowSet,
        insecure::DummyDataProcessor,
    },
    secret::{Session, deal_triples, simulated_sessions},
};

/// Party 0 owns `rows`, party 1 picks them at `indexes`. Returns the rows opened to party 1 and
/// to party 0, as seen by the party receiving them.
async fn share_and_open<P, F>(
    make: F,
    rows: &[Vec<u8>],
    indexes: &[i64],
) -> (Result<Vec<Vec<u8>>, Error>, Result<Vec<Vec<u8>>, Error>)
where
    P: DataProcessor,
    F: Fn(Session<SimpleChannel>) -> P,
{
    let (s0, s1, dealer) = simulated_sessions();
    let width = rows[0].len();
    let open = async |set: SecretSharedRowSet, session: &Session<SimpleChannel>| {
        let to_1 = set.open_to_party(session, 1).await?;
        let to_0 = set.open_to_party(session, 0).await?;
        Ok::<_, Error>(to_1.or(to_0).unwrap_or_default())
    };
    let owner = async {
        let set = make(s0.clone()).process_my_data(rows, indexes.len()).await;
        let opened = match set {
            Ok(set) => open(set, &s0).await,
            Err(e) => Err(e),
        };
        s0.finish().await.unwrap();
        opened
    };
    let picker = async {
        let set = make(s1.clone())
            .process_peers_data(rows.len(), indexes, width)
            .await;
        let opened = match set {
            Ok(set) => open(set, &s1).await,
            Err(e) => Err(e),
        };
        s1.finish().await.unwrap();
        opened
    };
    let (r0, r1, d) = tokio::join!(owner, picker, deal_triples(&dealer, [0, 1]));
    d.unwrap();
    (r0, r1)
}

fn sample_rows() -> Vec<Vec<u8>> {
    vec![vec![0xAA, 0xBB], vec![0xCC, 0xDD], vec![0xEE, 0xFF]]
}

#[tokio::test]
async fn aes_processor_picks_rows_in_index_order() {
    let (r0, r1) = share_and_open(AesDataProcessor::new, &sample_rows(), &[2, 0]).await;
    let expected = vec![vec![0xEE, 0xFF], vec![0xAA, 0xBB]];
    assert_eq!(r0.unwrap(), expected);
    assert_eq!(r1.unwrap(), expected);
}

#[tokio::test]
async fn dummy_processor_picks_rows_in_index_order() {
    let (r0, r1) = share_and_open(DummyDataProcessor::new, &sample_rows(), &[2, 0]).await;
    let expected = vec![vec![0xEE, 0xFF], vec![0xAA, 0xBB]];
    assert_eq!(r0.unwrap(), expected);
    assert_eq!(r1.unwrap(), expected);
}

#[tokio::test]
async fn rows_wider_than_a_block_are_truncated() {
    let rows: Vec<Vec<u8>> = (0..7u8)
        .map(|i| (0..20u8).map(|j| i.wrapping_mul(31) ^ j.wrapping_mul(7)).collect())
        .collect();
    let indexes = [6, 3, 3, 0, 5];
    let (r0, r1) = share_and_open(AesDataProcessor::new, &rows, &indexes).await;
    let expected: Vec<Vec<u8>> = indexes.iter().map(|&i| rows[i as usize].clone()).collect();
    assert_eq!(r0.unwrap(), expected);
    assert_eq!(r1.unwrap(), expected);
}

#[tokio::test]
async fn single_byte_rows() {
    let rows: Vec<Vec<u8>> = (0..=255u8).map(|i| vec![i]).collect();
    let indexes = [255, 0, 128, 1];
    let (r0, r1) = share_and_open(AesDataProcessor::new, &rows, &indexes).await;
    assert_eq!(r0.unwrap(), vec![vec![255], vec![0], vec![128], vec![1]]);
    assert_eq!(r1.unwrap(), vec![vec![255], vec![0], vec![128], vec![1]]);
}

#[tokio::test]
async fn disagreeing_shapes_are_detected() {
    let (s0, s1, dealer) = simulated_sessions();
    let rows = sample_rows();
    let owner = async {
        let r = AesDataProcessor::new(s0.clone()).process_my_data(&rows, 3).await;
        s0.finish().await.unwrap();
        r
    };
    let picker = async {
        let r = AesDataProcessor::new(s1.clone())
            .process_peers_data(3, &[2, 0], 2)
            .await;
        s1.finish().await.unwrap();
        r
    };
    let (r0, r1, d) = tokio::join!(owner, picker, deal_triples(&dealer, [0, 1]));
    d.unwrap();
    assert!(matches!(r0, Err(Error::ShapeMismatch { .. })));
    assert!(matches!(r1, Err(Error::ShapeMismatch { .. })));
}

#[tokio::test]
async fn invalid_calls_fail_before_any_interaction() {
    let (s0, _s1, _dealer) = simulated_sessions();
    let processor = AesDataProcessor::new(s0);
    assert!(matches!(
        processor.process_my_data(&[], 1).await,
        Err(Error::EmptyRows)
    ));
    assert!(matches!(
        processor.process_my_data(&sample_rows(), 0).await,
        Err(Error::ZeroOutputSize)
    ));
    assert!(matches!(
        processor.process_peers_data(3, &[3], 2).await,
        Err(Error::IndexOutOfRange { index: 3, rows: 3 })
    ));
}
