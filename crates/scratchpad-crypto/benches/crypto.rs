use scratchpad_crypto::{decrypt, encrypt, LocalKeypair, SymmetricKey};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt(bencher: divan::Bencher, size: usize) {
    let key = SymmetricKey::generate();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt(divan::black_box(&data), divan::black_box(&key)).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt(bencher: divan::Bencher, size: usize) {
    let key = SymmetricKey::generate();
    let data = make_data(size);
    let sealed = encrypt(&data, &key).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            decrypt(
                divan::black_box(&sealed.ciphertext),
                divan::black_box(&key),
                divan::black_box(&sealed.iv),
            )
            .unwrap()
        });
}

#[divan::bench]
fn bench_derive_symmetric_key(bencher: divan::Bencher) {
    let local = LocalKeypair::generate();
    let remote = LocalKeypair::generate();
    bencher.bench(|| {
        local
            .derive_symmetric_key(divan::black_box(remote.public_jwk()))
            .unwrap()
    });
}

fn main() {
    divan::main();
}
