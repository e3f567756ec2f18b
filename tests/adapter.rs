use polyudp::{
    adapter::{Adapter, AdapterFactory, Error, NO_VALUE, UnionAdapterFactory},
    secret::{Statistics, deal_triples, simulated_sessions},
    shuffle::{
        ShufflerFactory,
        insecure::{DummyShufflerFactory, NonShuffler},
    },
};
use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha20Rng;

async fn adapt_both<F: ShufflerFactory>(
    a: &[i64],
    b: &[i64],
    shufflers: [F; 2],
) -> (Result<Vec<i64>, Error>, Result<Vec<i64>, Error>) {
    let (s0, s1, dealer) = simulated_sessions();
    let [f0, f1] = shufflers;
    let party0 = async {
        let result = UnionAdapterFactory::new(s0.clone(), true, 0, 1, f0)
            .create()
            .adapt(a)
            .await;
        s0.finish().await.unwrap();
        result
    };
    let party1 = async {
        let result = UnionAdapterFactory::new(s1.clone(), false, 0, 1, f1)
            .create()
            .adapt(b)
            .await;
        s1.finish().await.unwrap();
        result
    };
    let (r0, r1, d) = tokio::join!(party0, party1, deal_triples(&dealer, [0, 1]));
    d.unwrap();
    (r0, r1)
}

#[tokio::test]
async fn single_match_is_found() {
    let a = [10, NO_VALUE, 11, 12, NO_VALUE];
    let b = [NO_VALUE, 20, 21, NO_VALUE, 22];
    let (r0, r1) = adapt_both(&a, &b, [NonShuffler, NonShuffler]).await;
    assert_eq!(r0.unwrap(), vec![21]);
    assert_eq!(r1.unwrap(), vec![11]);
}

#[tokio::test]
async fn no_match_gives_empty_maps() {
    let a = [0, NO_VALUE, 1, NO_VALUE];
    let b = [NO_VALUE, 0, NO_VALUE, 1];
    let (r0, r1) = adapt_both(&a, &b, [NonShuffler, NonShuffler]).await;
    assert_eq!(r0.unwrap(), Vec::<i64>::new());
    assert_eq!(r1.unwrap(), Vec::<i64>::new());
}

/// Random union maps of `size` slots and the pairs of local row indexes that truly match.
fn random_union(rng: &mut ChaCha20Rng, size: usize) -> (Vec<i64>, Vec<i64>, Vec<(i64, i64)>) {
    // 0: only a, 1: only b, 2: both
    let owners: Vec<u8> = (0..size).map(|_| rng.random_range(0..3)).collect();
    let mut rows_a: Vec<i64> = (0..owners.iter().filter(|&&o| o != 1).count() as i64).collect();
    let mut rows_b: Vec<i64> = (0..owners.iter().filter(|&&o| o != 0).count() as i64).collect();
    rows_a.shuffle(rng);
    rows_b.shuffle(rng);
    let (mut rows_a, mut rows_b) = (rows_a.into_iter(), rows_b.into_iter());

    let mut a = vec![NO_VALUE; size];
    let mut b = vec![NO_VALUE; size];
    let mut pairs = vec![];
    for (slot, owner) in owners.into_iter().enumerate() {
        if owner != 1 {
            a[slot] = rows_a.next().unwrap();
        }
        if owner != 0 {
            b[slot] = rows_b.next().unwrap();
        }
        if owner == 2 {
            pairs.push((a[slot], b[slot]));
        }
    }
    pairs.sort_unstable();
    (a, b, pairs)
}

#[tokio::test]
async fn shuffled_matches_pair_up() {
    let mut rng = ChaCha20Rng::seed_from_u64(17);
    for (run, size) in [1, 2, 7, 33, 100].into_iter().enumerate() {
        let (a, b, expected) = random_union(&mut rng, size);
        let seed = 1000 + run as u64;
        let shufflers = [DummyShufflerFactory::new(seed), DummyShufflerFactory::new(seed)];
        let (r0, r1) = adapt_both(&a, &b, shufflers).await;
        let (r0, r1) = (r0.unwrap(), r1.unwrap());
        assert_eq!(r0.len(), expected.len());
        assert_eq!(r1.len(), expected.len());
        let mut pairs: Vec<(i64, i64)> = r1.into_iter().zip(r0).collect();
        pairs.sort_unstable();
        assert_eq!(pairs, expected, "union of size {size}");
    }
}

#[tokio::test]
async fn unequal_union_sizes_are_rejected() {
    let (r0, r1) = adapt_both(&[0, 1], &[0], [NonShuffler, NonShuffler]).await;
    assert!(matches!(r0, Err(Error::UnionSizeMismatch(2, 1))));
    assert!(matches!(r1, Err(Error::UnionSizeMismatch(1, 2))));
}

#[tokio::test]
async fn empty_union_fails_without_a_peer() {
    let (s0, _s1, _dealer) = simulated_sessions();
    let result = UnionAdapterFactory::new(s0.clone(), true, 0, 1, NonShuffler)
        .create()
        .adapt(&[])
        .await;
    assert!(matches!(result, Err(Error::EmptyUnion)));
    assert_eq!(s0.statistics(), Statistics::default());
}
