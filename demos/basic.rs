use segalloc::{Heap, MmapSource};

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {addr:?}");
}

fn main() {
    let source = MmapSource::new(1 << 20).expect("address space reservation failed");
    let mut heap = Heap::init(source).expect("heap initialization failed");

    let addr1 = heap.alloc(8);
    log_alloc(addr1, 8);

    let addr2 = heap.alloc(100);
    log_alloc(addr2, 100);

    let addr3 = heap.calloc(4, 16);
    log_alloc(addr3, 64);

    unsafe {
        let addr2 = heap.realloc(addr2, 300);
        println!("Resized the second block to 300 bytes at {addr2:?}");

        heap.free(addr1);
        heap.free(addr2);
        heap.free(addr3);
    }

    println!("Heap consistent: {}", heap.check().is_ok());
}
