use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

// Far enough ahead that no slot is ever in the past.
const DAY: &str = "2031-06-10";

async fn connect(host: &str, port: u16, user: &str) -> tokio_postgres::Client {
    let password = std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotbook")
        .user(user)
        .password(password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// A service open the whole business day.
async fn setup_service(admin: &tokio_postgres::Client) -> Ulid {
    let sid = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO services (id, name, session_minutes) VALUES ('{sid}', 'bench', 15)"
        ))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            "INSERT INTO windows (id, service_id, date, start_time, end_time) VALUES ('{}', '{sid}', '{DAY}', '08:00', '15:00')",
            Ulid::new()
        ))
        .await
        .unwrap();
    sid
}

async fn free_starts(client: &tokio_postgres::Client, sid: Ulid) -> Vec<String> {
    client
        .simple_query(&format!(
            "SELECT * FROM availability WHERE service_id = '{sid}' AND date = '{DAY}'"
        ))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            tokio_postgres::SimpleQueryMessage::Row(row) => row.get("start_time").map(String::from),
            _ => None,
        })
        .collect()
}

/// Every task races for every slot of one service. Exactly one commit per
/// slot may win.
async fn phase1_same_slot_race(host: &str, port: u16, admin: &tokio_postgres::Client) {
    let sid = setup_service(admin).await;
    let slots = free_starts(admin, sid).await;
    let n_tasks = 16;

    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let host = host.to_string();
        let slots = slots.clone();
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("racer{i}")).await;
            let mut latencies = Vec::with_capacity(slots.len());
            for slot in &slots {
                let t = Instant::now();
                let result = client
                    .simple_query(&format!(
                        "INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ('{sid}', '{DAY}', '{slot}', 1)"
                    ))
                    .await;
                latencies.push(t.elapsed());
                match result {
                    Ok(_) => {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {} slots in {:.2}s: {wins} won, {} conflicts",
        slots.len(),
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(wins, slots.len(), "each slot must have exactly one winner");
    print_latency("commit latency", &mut all);
}

/// Many services, no contention: raw commit throughput.
async fn phase2_independent_services(host: &str, port: u16, admin: &tokio_postgres::Client) {
    let n_tasks = 10;
    let mut services = Vec::new();
    for _ in 0..n_tasks {
        services.push(setup_service(admin).await);
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for (i, sid) in services.into_iter().enumerate() {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("writer{i}")).await;
            let slots = free_starts(&client, sid).await;
            for slot in &slots {
                client
                    .simple_query(&format!(
                        "INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ('{sid}', '{DAY}', '{slot}', 1)"
                    ))
                    .await
                    .unwrap();
            }
            slots.len()
        }));
    }

    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} services, {total} commits in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
}

/// Availability reads while writers fill the day.
async fn phase3_reads_under_contention(host: &str, port: u16, admin: &tokio_postgres::Client) {
    let sid = setup_service(admin).await;
    let slots = free_starts(admin, sid).await;

    let mut writers = Vec::new();
    for w in 0..4 {
        let host = host.to_string();
        let slots = slots.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("filler{w}")).await;
            for slot in slots.iter().skip(w).step_by(4) {
                let _ = client
                    .simple_query(&format!(
                        "INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ('{sid}', '{DAY}', '{slot}', 1)"
                    ))
                    .await;
            }
        }));
    }

    let mut readers = Vec::new();
    for r in 0..8 {
        let host = host.to_string();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("reader{r}")).await;
            let mut latencies = Vec::with_capacity(200);
            for _ in 0..200 {
                let t = Instant::now();
                free_starts(&client, sid).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query", &mut all);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTBOOK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTBOOK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTBOOK_PORT");
    let admin_user = std::env::var("SLOTBOOK_BENCH_ADMIN").unwrap_or_else(|_| "admin".into());

    println!("=== slotbook contention benchmark ===");
    println!("target: {host}:{port}\n");

    let admin = connect(&host, port, &admin_user).await;

    println!("[phase 1] same-slot race");
    phase1_same_slot_race(&host, port, &admin).await;

    println!("\n[phase 2] independent services");
    phase2_independent_services(&host, port, &admin).await;

    println!("\n[phase 3] reads under contention");
    phase3_reads_under_contention(&host, port, &admin).await;

    println!("\n=== benchmark complete ===");
}
