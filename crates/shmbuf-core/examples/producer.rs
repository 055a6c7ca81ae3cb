//! 数据生产者 - 分配并写入共享内存
//!
//! 运行此程序创建共享内存段并写入数据，
//! 然后保持程序运行以便 consumer 读取。
//!
//! 使用方法:
//! ```bash
//! cargo run --example producer
//! ```

use shmbuf_core::{PosixShmConfig, PosixShmProviderBackend, ShmProviderBuilder};
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 创建 provider
    let config = PosixShmConfig::new()
        .with_size(1024 * 1024)
        .with_segment_prefix("shmbuf_demo");
    let backend = PosixShmProviderBackend::new(&config)?;
    println!("Created segment: {}", backend.segment().name());
    let provider = ShmProviderBuilder::backend(backend).build();

    // 分配 buffer 并写入
    let data = b"Hello from producer! This is shared memory.";
    let mut buf = provider.alloc(1024, 8)?;
    buf[..data.len()].copy_from_slice(data);

    // 冻结后只读，可被多方共享
    let buf = buf.freeze();
    let d = buf.descriptor();
    println!("Written {} bytes", data.len());
    println!(
        "Run: cargo run --example consumer -- {} {} {}",
        d.segment, d.chunk, d.len
    );

    // 保持 buffer 存活，供 consumer 读取
    println!("\nBuffer is alive. Press Ctrl+C to exit...");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
