use stress_test::{stress_test_gcounter, stress_test_orset, stress_test_scaling};

fn main() {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {}", err);
            std::process::exit(1);
        }
    };
    rt.block_on(async_main());
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATOR STRESS TESTS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: GCounter with small scale
    let stats = stress_test_gcounter(4, 100).await;
    stats.print();

    // Test 2: ORSet with small scale
    let stats = stress_test_orset(4, 100).await;
    stats.print();

    // Test 3: GCounter with medium scale
    let stats = stress_test_gcounter(10, 200).await;
    stats.print();

    // Test 4: ORSet with medium scale
    let stats = stress_test_orset(10, 200).await;
    stats.print();

    // Test 5: Scaling analysis
    stress_test_scaling(12, 4).await;

    println!("\n✓ All stress tests completed");
}
