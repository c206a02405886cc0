use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sandjs::Context;

fn bench_fib(c: &mut Criterion) {
    let code = r#"
        function fib(n) {
            if (n <= 1) { return n; }
            var a = 0;
            var b = 1;
            for (var i = 2; i <= n; i++) {
                var t = a + b;
                a = b;
                b = t;
            }
            return b;
        }
        var sum = 0;
        for (var i = 0; i < 100; i++) {
            sum += fib(30);
        }
        sum;
    "#;

    c.bench_function("fib_iter 100", |b| {
        b.iter(|| {
            let mut ctx = Context::new();
            black_box(ctx.eval(code).unwrap())
        })
    });
}

fn bench_loop(c: &mut Criterion) {
    let code = r#"
        var sum = 0;
        for (var i = 0; i < 10000; i++) {
            sum += i;
        }
        sum;
    "#;

    c.bench_function("loop 10k", |b| {
        b.iter(|| {
            let mut ctx = Context::new();
            black_box(ctx.eval(code).unwrap())
        })
    });
}

fn bench_array_push(c: &mut Criterion) {
    let code = r#"
        var arr = [];
        for (var i = 0; i < 10000; i++) {
            arr.push(i);
        }
        arr.length;
    "#;

    c.bench_function("array push 10k", |b| {
        b.iter(|| {
            let mut ctx = Context::new();
            black_box(ctx.eval(code).unwrap())
        })
    });
}

fn bench_string_concat(c: &mut Criterion) {
    let code = r#"
        var s = "";
        for (var i = 0; i < 500; i++) {
            s += "x";
        }
        s.length;
    "#;

    c.bench_function("string concat 500", |b| {
        b.iter(|| {
            let mut ctx = Context::new();
            black_box(ctx.eval(code).unwrap())
        })
    });
}

fn bench_regex(c: &mut Criterion) {
    let code = r#"
        var re = /(\w+)@(\w+)\.(\w+)/;
        var hits = 0;
        for (var i = 0; i < 1000; i++) {
            if (re.test("contact: someone@example.com")) { hits++; }
        }
        hits;
    "#;

    c.bench_function("regex test 1k", |b| {
        b.iter(|| {
            let mut ctx = Context::new();
            black_box(ctx.eval(code).unwrap())
        })
    });
}

fn bench_json(c: &mut Criterion) {
    let code = r#"
        var doc = {users: [], total: 0};
        for (var i = 0; i < 100; i++) {
            doc.users.push({id: i, name: "user" + i, active: i % 2 === 0});
        }
        JSON.parse(JSON.stringify(doc)).users.length;
    "#;

    c.bench_function("json round-trip 100", |b| {
        b.iter(|| {
            let mut ctx = Context::new();
            black_box(ctx.eval(code).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_fib,
    bench_loop,
    bench_array_push,
    bench_string_concat,
    bench_regex,
    bench_json
);
criterion_main!(benches);
