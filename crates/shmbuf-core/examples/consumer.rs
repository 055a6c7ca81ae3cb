//! 数据消费者 - 映射并读取共享内存
//!
//! 先运行 producer，再用它打印的参数运行此程序。
//!
//! 使用方法:
//! ```bash
//! cargo run --example consumer -- <segment> <chunk> <len>
//! ```

use shmbuf_core::{ChunkDescriptor, PosixShmClient, ShmClientStorage, POSIX_PROTOCOL_ID};
use std::num::NonZeroUsize;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 3 {
        eprintln!("usage: consumer <segment> <chunk> <len>");
        std::process::exit(2);
    }
    let segment: u32 = args[0].parse()?;
    let chunk: u32 = args[1].parse()?;
    let len: NonZeroUsize = args[2].parse()?;

    // 只注册 demo 使用的前缀
    let storage = ShmClientStorage::builder()
        .with_client(Arc::new(PosixShmClient::new("shmbuf_demo")))
        .build();

    // 映射块（只读）
    let buf = storage.attach_chunk(POSIX_PROTOCOL_ID, ChunkDescriptor::new(segment, chunk, len))?;
    let text_len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    println!("Read: {}", String::from_utf8_lossy(&buf[..text_len]));

    Ok(())
}
